mod support;

use ktable_client::Endpoint;
use ktable_common::KtableError;
use ktable_codec::transform_outward;
use support::{client, numbers, places_schema, FakeServer};

#[test]
fn missing_table_opens_unbound() {
    let server = FakeServer::new(10);
    let table = client(&server, "ktable_life_unbound").table("nowhere").expect("table");
    assert!(!table.exists());
    assert!(table.schema().expect_err("no schema").is_not_found());
    assert!(table.select("", &[]).err().expect("select").is_not_found());
    assert!(table.begin().err().expect("begin").is_not_found());
    assert_eq!(server.calls(Endpoint::Begin), 0);
    // dropping a table that is not there is not an error
    table.drop().expect("drop missing");
}

#[test]
fn create_binds_and_reopen_recovers_the_outer_schema() {
    let server = FakeServer::new(10);
    let c = client(&server, "ktable_life_create");
    let table = c.table("places").expect("table");
    table.create(places_schema()).expect("create");
    assert!(table.exists());
    assert_eq!(table.schema().expect("schema"), places_schema());

    let inner = table.inner_schema().expect("inner");
    let names = inner.fields().iter().map(|f| f.name().as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["name", "loc", "loc.x", "loc.y", "loc.q"]);

    let reopened = c.table("places").expect("reopen");
    assert!(reopened.exists());
    assert_eq!(reopened.schema().expect("schema"), transform_outward(&inner));
    assert_eq!(reopened.schema().expect("schema"), places_schema());
}

#[test]
fn drop_and_delete_schema_unbind_the_handle() {
    let server = FakeServer::new(10);
    let c = client(&server, "ktable_life_drop");
    let table = c.table("places").expect("table");
    table.create(places_schema()).expect("create");
    table.drop().expect("drop");
    assert!(!table.exists());
    assert!(!c.table("places").expect("reopen").exists());

    table.create(places_schema()).expect("recreate");
    table.delete_schema(true).expect("delete schema");
    assert!(!table.exists());
    assert_eq!(server.calls(Endpoint::DeleteSchema), 1);
}

#[test]
fn queries_on_unknown_columns_fail_before_any_request() {
    let server = FakeServer::new(10);
    let table = client(&server, "ktable_life_unknown").table("places").expect("table");
    table.create(places_schema()).expect("create");
    let err = table.select("height > 3", &[]).err().expect("unknown column");
    assert!(matches!(err, KtableError::Compile(_)), "{err}");
    assert!(err.to_string().contains("height"));
    let err = table.select("name ==", &[]).err().expect("bad syntax");
    assert!(matches!(err, KtableError::Parse { .. }), "{err}");
    assert_eq!(server.calls(Endpoint::Select), 0);
}

#[test]
fn inserted_batches_must_fit_the_table_schema() {
    let server = FakeServer::new(10);
    let table = client(&server, "ktable_life_fit").table("places").expect("table");
    table.create(places_schema()).expect("create");
    let err = table
        .transaction(|tx| tx.insert(&numbers([1])))
        .expect_err("wrong columns");
    assert!(matches!(err, KtableError::InvalidArgument(_)), "{err}");
    assert!(err.to_string().contains("unknown column: n"), "{err}");
}
