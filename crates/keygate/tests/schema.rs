//! Schema loading from disk, live updates through the topology watch, and
//! explicit reloads.

mod common;

use std::time::Duration;

use anyhow::{Context, Result};
use common::{Cluster, VSCHEMA_JSON};
use keygate::vschema::KeyspaceDoc;
use keygate::{GateConfig, GateError, VSchemaSource};

#[test]
fn schema_file_loads_and_missing_files_are_named() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vschema.json");
    std::fs::write(&path, VSCHEMA_JSON)?;

    let source = VSchemaSource::from_file(&path)?;
    assert_eq!(source, VSchemaSource::from_json(VSCHEMA_JSON)?);

    let missing = VSchemaSource::from_file(dir.path().join("absent.json"))
        .expect_err("missing file");
    assert!(format!("{missing:#}").contains("absent.json"));
    Ok(())
}

#[tokio::test]
async fn published_schema_reaches_the_router() -> Result<()> {
    let cluster = Cluster::start_with(GateConfig {
        schema_watch_interval: Duration::from_millis(20),
        ..GateConfig::default()
    })
    .await?;
    cluster.gate.start();

    let source = VSchemaSource::from_json(VSCHEMA_JSON)?;
    let mut user = source
        .keyspaces
        .get("user")
        .cloned()
        .context("user keyspace")?;
    user.tables.insert(
        "payments".to_string(),
        serde_json::from_str(r#"{"column_vindexes": [{"column": "user_id", "name": "hash_index"}]}"#)?,
    );
    cluster.topology.publish_schema(source.with_keyspace("user", user));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let vschema = cluster.gate.vschema();
        if vschema.keyspace("user")?.table("payments").is_some() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "schema update never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let metrics = cluster.gate.metrics();
    assert_eq!(metrics.schema_reloads, 1);
    assert_eq!(metrics.schema_watch_errors, 0);
    cluster.gate.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invalid_reload_keeps_the_current_schema() -> Result<()> {
    let cluster = Cluster::start().await?;
    let broken = VSchemaSource::from_json(VSCHEMA_JSON)?.with_keyspace(
        "user",
        KeyspaceDoc::from_json(
            r#"{"sharded": true,
                "tables": {"users": {"column_vindexes": [{"column": "id", "name": "nope"}]}}}"#,
        )?,
    );

    let err = cluster
        .gate
        .reload_schema(broken)
        .expect_err("unknown vindex must be rejected");
    assert!(matches!(err, GateError::Schema(_)), "{err}");
    assert!(cluster.gate.vschema().keyspace("user")?.table("orders").is_some());

    let metrics = cluster.gate.metrics();
    assert_eq!(metrics.schema_watch_errors, 1);
    assert_eq!(metrics.schema_reloads, 0);

    let mut session = cluster.session();
    cluster
        .exec(&mut session, "insert into users (id, name) values (1, 'a')")
        .await?;
    let text = cluster.gate.metrics().render_text();
    assert!(text.contains("queries=1"), "{text}");
    Ok(())
}
