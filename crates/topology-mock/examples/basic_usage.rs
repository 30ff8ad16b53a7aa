use cachex_topology::{NodeId, TopologySource};
use cachex_topology_mock::MockTopology;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let node1 = NodeId::from_seed(1);
    let node2 = NodeId::from_seed(2);

    let topology = MockTopology::with_nodes(&[node1, node2]);
    let mut subscription = topology.subscribe();
    let mut previous = subscription.latest();

    println!(
        "Version {} coordinator {:?}",
        previous.version(),
        previous.coordinator()
    );

    topology.add_node(NodeId::from_seed(3))?;
    topology.remove_node(node1)?;

    subscription.changed().await?;
    let current = subscription.latest();
    let change = current.diff(&previous);
    println!(
        "Version {} -> {}: joined {:?}, left {:?}, coordinator {:?}",
        change.from_version,
        change.to_version,
        change.joined,
        change.left,
        current.coordinator()
    );
    previous = current;

    println!("Members now: {:?}", previous.node_ids());
    Ok(())
}
