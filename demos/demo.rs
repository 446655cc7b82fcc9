use maggregator::{
    Accumulator, Aggregator, EmbeddedDb, Filter, Group, ImportOptions, Projection, first_field,
};
use serde_json::Value;

const FIXTURE: &str = r#"[
    {"name": "MongoDB", "type": "database", "count": 3, "info": {"x": 203, "y": 102}},
    {"name": "MongoDB", "type": "database", "count": 3, "info": {"x": 203, "y": 102}},
    {"name": "Redis",   "type": "cache",    "count": 5, "info": {"x": 120, "y": 40}}
]"#;

fn main() -> maggregator::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let db = EmbeddedDb::new();
    db.import_str("tools", FIXTURE, &ImportOptions::default())?;

    println!("=== Totals per type ===");
    let groups: Vec<Value> = Aggregator::of(&db)?
        .collection("tools")
        .filter(Filter::all())
        .projection(Projection::new().exclude_id().include(["type", "count"]))
        .group_by(
            Group::by_field("type")
                .accumulate("total", Accumulator::sum_of("count"))
                .accumulate("names", Accumulator::Push("$name".into())),
        )
        .execute(|cursor| cursor.collect::<maggregator::Result<Vec<_>>>())??;
    for doc in &groups {
        println!("  {}", doc);
    }

    println!("\n=== Total for MongoDB ===");
    let total: i64 = Aggregator::of(&db)?
        .collection("tools")
        .filter(Filter::eq("name", "MongoDB"))
        .projection(Projection::new().include(["name", "count"]))
        .group_by(Group::by_field("name").accumulate("total", Accumulator::sum_of("count")))
        .execute(|cursor| first_field(cursor, "total", 0_i64))??;
    println!("  {}", total);

    Ok(())
}
