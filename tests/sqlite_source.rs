use std::{path::Path, sync::Arc};

use serde_json::json;
use sqlx_request_template::{
    DBType, DataSource, DataSourceRegistry, Error, ExecuteContext, ExportOptions, Parameterizer,
    Profile, ProfileConfig, QueryBuilder, SqlxDataSource, TemplateEngine,
};

fn profile(dir: &Path) -> Profile {
    let url = format!("sqlite://{}?mode=rwc", dir.join("app.db").display());
    Profile::new("local", "sqlite", url)
        .with_max_connections(2)
        .with_chunk_size(2)
        .with_export_partition_size(2)
}

async fn run(source: &Arc<SqlxDataSource>, sql: &str) -> Result<(), Error> {
    let builder = QueryBuilder::new(sql, "local", Parameterizer::new(source.clone()));
    builder.value().await?.fetch_all().await?;
    Ok(())
}

async fn seeded(dir: &Path) -> Arc<SqlxDataSource> {
    let source = Arc::new(SqlxDataSource::new(DBType::SQLite, [profile(dir)]));
    source.activate().await.unwrap();
    run(&source, "create table users (id integer primary key, name text not null)")
        .await
        .unwrap();

    let mut p = Parameterizer::new(source.clone());
    let names = ["freda", "bob", "carol", "dave", "erin"];
    let values: Vec<String> = names
        .iter()
        .enumerate()
        .map(|(i, name)| format!("({}, {})", p.bind(i as i64 + 1), p.bind(*name)))
        .collect();
    let insert = QueryBuilder::new(
        format!("insert into users (id, name) values {}", values.join(", ")),
        "local",
        p,
    );
    insert.value().await.unwrap().fetch_all().await.unwrap();
    source
}

#[tokio::test]
async fn executes_with_operations_and_streams_in_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded(dir.path()).await;

    let mut p = Parameterizer::new(source.clone());
    let min_id = p.bind(1);
    let mut builder = QueryBuilder::new(
        format!("select id, name from users where id > {min_id} order by id"),
        "local",
        p,
    );
    builder.limit(2).offset(1);
    let result = builder.value().await.unwrap();
    let names: Vec<_> = result.columns().iter().map(|c| c.name.clone()).collect();
    assert_eq!(names, vec!["id", "name"]);
    let rows = result.fetch_all().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], json!(3));
    assert_eq!(rows[1]["name"], json!("dave"));

    // five rows through a two-row buffer
    let all = QueryBuilder::new("select * from users", "local", Parameterizer::new(source.clone()));
    assert_eq!(all.value().await.unwrap().fetch_all().await.unwrap().len(), 5);

    source.destroy().await.unwrap();
}

#[tokio::test]
async fn overwritten_operations_only_send_the_latest_values() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded(dir.path()).await;

    let mut builder = QueryBuilder::new(
        "select id from users order by id",
        "local",
        Parameterizer::new(source.clone()),
    );
    builder.limit(5).offset(10).take(2, 1);
    let rows = builder.value().await.unwrap().fetch_all().await.unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(2), json!(3)]);
    source.destroy().await.unwrap();
}

#[tokio::test]
async fn dropped_stream_returns_its_connection() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded(dir.path()).await;

    for _ in 0..4 {
        let builder = QueryBuilder::new("select * from users", "local", Parameterizer::new(source.clone()));
        let result = builder.value().await.unwrap();
        drop(result);
    }
    let count = QueryBuilder::new(
        "select count(*) as n from users",
        "local",
        Parameterizer::new(source.clone()),
    );
    let rows = count.value().await.unwrap().fetch_all().await.unwrap();
    assert_eq!(rows[0]["n"], json!(5));
    source.destroy().await.unwrap();
}

#[tokio::test]
async fn backend_errors_surface_as_execution_errors() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded(dir.path()).await;
    let err = run(&source, "select * from missing_table").await.unwrap_err();
    assert!(matches!(err, Error::Execution(_)), "{err}");
    // the pool keeps serving after a failed statement
    run(&source, "select 1").await.unwrap();
    source.destroy().await.unwrap();
}

#[tokio::test]
async fn export_writes_one_file_per_partition() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded(dir.path()).await;
    let out = dir.path().join("out");
    std::fs::create_dir(&out).unwrap();

    source
        .export(ExportOptions {
            statement: "select id, name from users order by id;".into(),
            directory: out.clone(),
            profile_name: "local".into(),
        })
        .await
        .unwrap();

    let mut files: Vec<_> = std::fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    files.sort();
    assert_eq!(files, vec!["part-0.jsonl", "part-1.jsonl", "part-2.jsonl"]);
    let lines: usize = files
        .iter()
        .map(|f| std::fs::read_to_string(out.join(f)).unwrap().lines().count())
        .sum();
    assert_eq!(lines, 5);
    source.destroy().await.unwrap();
}

#[tokio::test]
async fn failed_export_leaves_earlier_files_alone() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded(dir.path()).await;
    let out = dir.path().join("out");
    std::fs::create_dir(&out).unwrap();
    std::fs::write(out.join("part-0.jsonl"), "{}\n").unwrap();

    let err = source
        .export(ExportOptions {
            statement: "select * from missing_table".into(),
            directory: out.clone(),
            profile_name: "local".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Export(_)), "{err}");
    assert_eq!(std::fs::read_to_string(out.join("part-0.jsonl")).unwrap(), "{}\n");
    source.destroy().await.unwrap();
}

#[tokio::test]
async fn export_validates_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let source = SqlxDataSource::new(DBType::SQLite, [profile(dir.path())]);
    source.activate().await.unwrap();

    let err = source
        .export(ExportOptions {
            statement: "select 1".into(),
            directory: dir.path().join("missing"),
            profile_name: "local".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "{err}");

    source.destroy().await.unwrap();
    // destroyed profiles are unknown
    let err = source
        .export(ExportOptions {
            statement: "select 1".into(),
            directory: dir.path().to_path_buf(),
            profile_name: "local".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "{err}");
    source.destroy().await.unwrap();
}

#[tokio::test]
async fn failing_profile_does_not_block_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let broken = Profile::new("broken", "sqlite", "sqlite:///nonexistent-dir/x.db?mode=ro");
    let source = SqlxDataSource::new(DBType::SQLite, [broken, profile(dir.path())]);
    let err = source.activate().await.unwrap_err();
    assert!(matches!(err, Error::Connection { ref profile, .. } if profile == "broken"), "{err}");

    let source = Arc::new(source);
    run(&source, "select 1").await.unwrap();
    source.destroy().await.unwrap();
}

#[tokio::test]
async fn templates_run_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let source = seeded(dir.path()).await;

    let profiles = ProfileConfig::new(vec![profile(dir.path())]).unwrap();
    let mut sources = DataSourceRegistry::new();
    sources.register("sqlite", source.clone()).unwrap();
    let mut engine = TemplateEngine::new(profiles, sources);
    engine
        .add_template(
            "neighbours",
            r#"
{% req first %}
select id, name from users where name = {{ context.params.name }}
{% endreq %}
{% req others main %}
select id, name from users where id > {{ first.value()[0].id }} order by id
{% endreq %}
"#,
        )
        .unwrap();

    let result = engine
        .execute(
            "neighbours",
            ExecuteContext::new("local")
                .with_params(json!({ "name": "bob" }))
                .with_pagination(2, 0),
        )
        .await
        .unwrap();
    let rows = result.fetch_all().await.unwrap();
    let names: Vec<_> = rows.iter().map(|r| r["name"].clone()).collect();
    assert_eq!(names, vec![json!("carol"), json!("dave")]);

    engine.sources().destroy_all().await.unwrap();
}
