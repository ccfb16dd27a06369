use relstore::graph::{shared, Delivery, EventFilter, NodeId, Relationship, RelationalStore, StoreEvent};
use relstore::patch::PatchOperation;
use serde_json::{json, Value};

#[derive(Debug)]
struct IsFriendOf;
impl Relationship for IsFriendOf {}

#[derive(Debug)]
struct LivesInSameTown;
impl Relationship for LivesInSameTown {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("relstore v{}", relstore::version());
    println!("==========================================");
    println!();

    demo_relationships()?;
    demo_event_channel().await?;

    Ok(())
}

fn town(store: &RelationalStore<Value>, node: NodeId) -> Option<String> {
    let node = store.get_node(node)?;
    let town = node.data().get("town")?.as_str()?.to_string();
    Some(town)
}

fn demo_relationships() -> anyhow::Result<()> {
    println!("=== Demo 1: Relationships ===");
    let mut store = RelationalStore::new();

    store.on(EventFilter::Any, Delivery::Sync, |_, event: &StoreEvent<Value>| {
        println!("  event: {}", event.kind());
    });

    let john = shared(json!({ "name": "John", "town": "Leeds" }));
    let smith = shared(json!({ "name": "Smith", "town": "Leeds" }));
    store.add_node(john.clone(), Some("john"));
    store.add_node(smith.clone(), Some("smith"));
    println!("✓ Added John and Smith");

    store.add_edge("john", "smith", IsFriendOf)?;
    println!("✓ John is a friend of Smith");

    store.add_edge_if("john", "smith", LivesInSameTown, |store, source, target, _| {
        let (Some(a), Some(b)) = (town(store, source), town(store, target)) else {
            return false;
        };
        a == b
    })?;
    println!("✓ John lives in the same town as Smith (while it holds)");

    store.patch_node("smith", &[PatchOperation::replace("/town", "York")])?;
    store.flush();

    println!(
        "  same town after Smith moved: {}",
        store.has_relationship::<LivesInSameTown>("john", "smith")
    );
    println!(
        "  still friends: {}",
        store.has_relationship::<IsFriendOf>("john", "smith")
    );
    println!();
    Ok(())
}

async fn demo_event_channel() -> anyhow::Result<()> {
    println!("=== Demo 2: Event Channel ===");
    let (mut store, mut events) = RelationalStore::with_event_channel();

    let a = store.add_node(shared(json!({ "name": "A" })), None);
    let b = store.add_node(shared(json!({ "name": "B" })), None);
    store.add_edge(a, b, IsFriendOf)?;
    store.remove_node(b);
    drop(store);

    while let Some(record) = events.recv().await {
        println!("  {}", serde_json::to_string(&record)?);
    }

    Ok(())
}
