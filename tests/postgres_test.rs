//! Live backend tests against PostgreSQL.
//!
//! Set `TEST_DATABASE_URL` to run them, e.g.
//! `TEST_DATABASE_URL=postgres://postgres@localhost/postgres cargo test`.
//! Without it every test returns early.

use bytes::Bytes;
use serde_json::json;
use sql_link::observe::Event;
use sql_link::{
    Connection, ConnectionOptions, CopyStream, Link, LinkError, MemoryObserver, Param, params,
};
use std::path::PathBuf;
use std::sync::Arc;

fn sql_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("sql")
}

fn link() -> Option<(Link, MemoryObserver)> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };
    let options = ConnectionOptions::parse(&url).unwrap();
    let observer = MemoryObserver::new();
    let link = Link::new(options, sql_dir())
        .unwrap()
        .with_observer(Arc::new(observer.clone()));
    Some((link, observer))
}

#[tokio::test]
async fn test_value_row_column_table() {
    let Some((link, _)) = link() else { return };
    let (value, row, column, table) = link
        .connect(async |sql: &Connection<'_>| {
            Ok::<_, LinkError>((
                sql.invoke("selectInteger", params![43]).await?,
                sql.invoke("selectIntegerAndString", params![42, "abc"]).await?,
                sql.invoke("selectColumn", params![2]).await?,
                sql.invoke("selectSeries", params![2]).await?,
            ))
        })
        .await
        .unwrap();

    assert_eq!(value, Some(json!(43)));
    assert_eq!(row, Some(json!({"number": 42, "str": "abc"})));
    assert_eq!(column, Some(json!([0, 1, 2])));
    assert_eq!(table, Some(json!([{"num": 0}, {"num": 1}, {"num": 2}])));
    link.disconnect().await;
}

#[tokio::test]
async fn test_raw_result() {
    let Some((link, _)) = link() else { return };
    let result = link
        .connect(async |sql: &Connection<'_>| sql.invoke("selectResult", params![4]).await)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result["rowCount"], json!(5));
    assert_eq!(result["columns"], json!(["num"]));
    assert_eq!(result["rows"].as_array().unwrap().len(), 5);
    link.disconnect().await;
}

#[tokio::test]
async fn test_error_diagnostics() {
    let Some((link, observer)) = link() else { return };
    let err = link
        .connect(async |sql: &Connection<'_>| sql.invoke("error", params![]).await)
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::QueryFailed { .. }));
    assert!(err.to_string().contains("this_column_doesnt_exist"));
    let diagnostics = err.diagnostics().unwrap();
    assert_eq!(diagnostics["code"], json!("42703"));
    assert!(diagnostics["position"].is_u64());
    assert_eq!(err.context().unwrap().operation, "error");
    assert!(err.context().unwrap().callsite.as_ref().unwrap().contains("postgres_test.rs"));

    let err = link
        .connect(async |sql: &Connection<'_>| sql.invoke("divideByZero", params![]).await)
        .await
        .unwrap_err();
    assert_eq!(err.diagnostics().unwrap()["code"], json!("22012"));

    let err = link
        .connect(async |sql: &Connection<'_>| {
            sql.invoke("errorWithArguments", params![1, 2, 3]).await
        })
        .await
        .unwrap_err();
    let context = err.context().unwrap();
    assert_eq!(context.arguments, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(context.return_kind(), Some("row"));

    let fails = observer
        .events()
        .into_iter()
        .filter(|event| matches!(event, Event::Fail { message, .. } if message == "query failed"))
        .count();
    assert_eq!(fails, 3);
    link.disconnect().await;
}

#[tokio::test]
async fn test_value_types() {
    let Some((link, _)) = link() else { return };
    let (bytes, array, doc, row) = link
        .connect(async |sql: &Connection<'_>| {
            Ok::<_, LinkError>((
                sql.invoke("selectBytes", vec![Param::bytes(vec![0xde, 0xad])]).await?,
                sql.invoke("selectArray", vec![Param::from(vec![Param::Int(1), Param::Int(2)])])
                    .await?,
                sql.invoke("selectJson", vec![Param::from(json!({"a": [1, true]}))])
                    .await?,
                sql.invoke("selectNumeric", params![]).await?,
            ))
        })
        .await
        .unwrap();

    assert_eq!(bytes, Some(json!("\\xdead")));
    assert_eq!(array, Some(json!([1, 2])));
    assert_eq!(doc, Some(json!({"a": [1, true]})));

    let row = row.unwrap();
    assert!(row["price"].as_str().unwrap().starts_with("12.5"));
    assert_eq!(row["id"].as_str().unwrap().len(), 36);
    assert!(row["at"].is_string());
    link.disconnect().await;
}

#[tokio::test]
async fn test_transactions() {
    let Some((link, observer)) = link() else { return };
    link.connect(async |sql: &Connection<'_>| {
        sql.invoke("dropTxnTable", params![]).await?;
        sql.invoke("createTxnTable", params![]).await
    })
    .await
    .unwrap();

    // Nested txn runs on its own connection and commits independently.
    link.txn(async |outer: &Connection<'_>| {
        outer.invoke("insertN", params![1]).await?;
        link.txn(async |inner: &Connection<'_>| {
            assert_ne!(inner.id(), outer.id());
            inner.invoke("insertN", params![2]).await
        })
        .await?;
        outer.invoke("insertN", params![3]).await
    })
    .await
    .unwrap();
    let sum = link
        .connect(async |sql: &Connection<'_>| sql.invoke("sumN", params![]).await)
        .await
        .unwrap();
    assert_eq!(sum, Some(json!(6)));

    let err = link
        .txn(async |sql: &Connection<'_>| {
            sql.invoke("zeroN", params![]).await?;
            sql.invoke("error", params![]).await
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::QueryFailed { .. }));
    let sum = link
        .connect(async |sql: &Connection<'_>| sql.invoke("sumN", params![]).await)
        .await
        .unwrap();
    assert_eq!(sum, Some(json!(6)));

    let read_only = link
        .txn_with(Some("isolation level serializable, read only"), async |sql: &Connection<'_>| {
            sql.invoke("zeroN", params![]).await
        })
        .await
        .unwrap_err();
    assert_eq!(read_only.diagnostics().unwrap()["code"], json!("25006"));

    let statements: Vec<String> = observer
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::Info { message, .. } if message != "query" => Some(message),
            _ => None,
        })
        .collect();
    assert!(statements.contains(&"begin isolation level serializable, read only".to_string()));
    assert!(statements.contains(&"rollback".to_string()));

    link.connect(async |sql: &Connection<'_>| sql.invoke("dropTxnTable", params![]).await)
        .await
        .unwrap();
    link.disconnect().await;
}

#[tokio::test]
async fn test_copy_in_and_out() {
    let Some((link, _)) = link() else { return };
    let (written, count, read, chunks) = link
        .connect(async |sql: &Connection<'_>| {
            sql.invoke("dropCopyTable", params![]).await?;
            sql.invoke("createCopyTable", params![]).await?;
            let written = sql
                .invoke_with_stream("copyIn", params![], async |stream: &mut CopyStream<'_>| {
                    stream.write("1\n2\n").await?;
                    stream.write(b"3\n").await
                })
                .await?;
            let count = sql.invoke("countCopy", params![]).await?;

            let mut chunks: Vec<Bytes> = Vec::new();
            let read = sql
                .invoke_with_stream("copyOut", params![], async |stream: &mut CopyStream<'_>| {
                    while let Some(chunk) = stream.read().await? {
                        chunks.push(chunk);
                    }
                    Ok::<_, LinkError>(())
                })
                .await?;
            sql.invoke("dropCopyTable", params![]).await?;
            Ok::<_, LinkError>((written, count, read, chunks))
        })
        .await
        .unwrap();

    assert_eq!(written, Some(json!(3)));
    assert_eq!(count, Some(json!(3)));
    assert_eq!(read, Some(json!(5)));
    let text: String = chunks
        .iter()
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();
    assert_eq!(text, "1\n2\n3\n4\n5\n");
    link.disconnect().await;
}

#[tokio::test]
async fn test_copy_stream_direction_is_enforced() {
    let Some((link, _)) = link() else { return };
    let err = link
        .connect(async |sql: &Connection<'_>| {
            sql.invoke_with_stream("copyOut", params![], async |stream: &mut CopyStream<'_>| {
                stream.write("1\n").await
            })
            .await
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Usage { .. }));

    let err = link
        .connect(async |sql: &Connection<'_>| {
            sql.invoke_with_stream("selectInteger", params![1], async |_: &mut CopyStream<'_>| {
                Ok::<_, LinkError>(())
            })
            .await
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("does not return a stream"));
    link.disconnect().await;
}
