//! Reference link: a tree of counters and one test action.
//!
//! - `/Test`                   invokable (`write`), returns one row `[true]`
//! - `/ContainerN/TestValM`    number nodes, N in 1..=5, M in 1..=50,
//!                             all driven by one shared counter
//!
//! Usage:
//!   dslink-rng --broker http://localhost:8080/conn --log debug
//!
//! Settings come from `dslink.toml` (see `--config`) when present; the
//! flags override it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dslink_sdk::{
    Action, Column, InvokeRequest, Link, LinkBuilder, LinkConfig, LinkHooks, NodeId, NodeTree,
    Parameter, Permission,
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

const CONTAINERS: usize = 5;
const VALUES_PER_CONTAINER: usize = 50;

/// Random number generator link.
#[derive(Debug, Parser)]
#[command(name = "dslink-rng", version, about)]
struct Cli {
    /// Broker `conn` endpoint.
    #[arg(long)]
    broker: Option<String>,
    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log: Option<String>,
    /// Link settings file.
    #[arg(long, default_value = "dslink.toml")]
    config: PathBuf,
    /// Delay between counter sweeps, in milliseconds.
    #[arg(long, default_value_t = 100)]
    update_ms: u64,
}

/// Every node built from the `rng` class.  Resolved through the tree on
/// each sweep so removed nodes drop out.
#[derive(Clone, Default)]
struct RngValues(Arc<Mutex<Vec<NodeId>>>);

struct RngNodes;

impl LinkHooks for RngNodes {
    fn initialize_default_nodes(&self, tree: &NodeTree) {
        if let Err(e) = build_default_nodes(tree) {
            tracing::error!(error = %e, "failed to build default nodes");
        }
    }

    fn on_connection_open(&self) {
        tracing::info!("rng link online");
    }

    fn on_connection_failed(&self) {
        tracing::error!("giving up on the broker");
    }
}

fn build_default_nodes(tree: &NodeTree) -> anyhow::Result<()> {
    let root = tree.root();
    tree.create_child_of_class(&root, "Test", "testAction")?.build()?;
    for x in 1..=CONTAINERS {
        let container = tree.create_child(&root, format!("Container{x}"))?.build()?;
        for i in 1..=VALUES_PER_CONTAINER {
            tree.create_child_of_class(&container, format!("TestVal{i}"), "rng")?
                .build()?;
        }
    }
    Ok(())
}

fn register_classes(tree: &NodeTree, values: &RngValues) {
    tree.add_node_class("testAction", |node| {
        node.add_parameter(&Parameter::new("string", "string"));
        node.add_parameter(&Parameter::new("int", "int"));
        node.add_parameter(&Parameter::new("number", "number"));
        node.add_column(&Column::new("success", "bool"));
        node.set_action(Action::new(Permission::Write, |request: InvokeRequest| async move {
            tracing::debug!(rid = request.rid(), params = %request.params(), "test action");
            request.update_table(vec![vec![true.into()]]);
            request.close();
        }));
    });

    let values = values.clone();
    tree.add_node_class("rng", move |node| {
        node.set_config("writable", Permission::Read.as_str());
        node.set_config("type", "number");
        node.set_value(0.1);
        values.0.lock().push(node.id());
    });
}

/// Bump the shared counter into every rng value until shutdown.
async fn run_updater(link: Link, values: RngValues, every: Duration) {
    let mut counter: i64 = 0;
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let ids = values.0.lock().clone();
        let tree = link.tree();
        for id in ids {
            if let Some(node) = tree.node(id) {
                node.set_value(counter);
                counter += 1;
            }
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<LinkConfig> {
    let mut config = if cli.config.exists() {
        LinkConfig::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        LinkConfig {
            name: "sdk-rust-rng".into(),
            requester: true,
            communication_format: "msgpack".into(),
            ..LinkConfig::default()
        }
    };
    config.apply_overrides(cli.broker.clone(), cli.log.clone());
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    // ── Tracing ────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "dslink_sdk={level},dslink_rng={level}",
                level = config.log_level
            ))
        }))
        .init();

    tracing::info!(name = %config.name, broker = %config.broker_url, "rng link starting");

    // ── Link ───────────────────────────────────────────────────────
    let link = LinkBuilder::new().config(config).hooks(RngNodes).build()?;
    let values = RngValues::default();
    register_classes(link.tree(), &values);

    link.connect().await?;

    let updater = tokio::spawn(run_updater(
        link.clone(),
        values,
        Duration::from_millis(cli.update_ms.max(1)),
    ));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    updater.abort();
    if link.config().load_nodes_json && !link.save_nodes().await {
        tracing::warn!("node snapshot not saved");
    }
    link.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dslink_sdk::{Outbox, Variant};

    fn tree() -> (NodeTree, RngValues) {
        let tree = NodeTree::new(Outbox::detached());
        let values = RngValues::default();
        register_classes(&tree, &values);
        build_default_nodes(&tree).unwrap();
        (tree, values)
    }

    #[test]
    fn default_tree_shape() {
        let (tree, values) = tree();
        assert_eq!(values.0.lock().len(), CONTAINERS * VALUES_PER_CONTAINER);
        let test = tree.get("/Test").unwrap();
        assert_eq!(test.class_name(), "testAction");
        assert_eq!(test.config("invokable"), Some(Variant::from("write")));
        assert!(test.action().is_some());

        let val = tree.get("/Container5/TestVal50").unwrap();
        assert_eq!(val.class_name(), "rng");
        assert_eq!(val.value().get(), Variant::Float(0.1));
        assert_eq!(val.writable(), Some(Permission::Read));
    }

    #[tokio::test]
    async fn updater_counts_across_values() {
        let values = RngValues::default();
        let link = LinkBuilder::new()
            .handshaker(NeverHandshake)
            .build()
            .unwrap();
        register_classes(link.tree(), &values);
        build_default_nodes(link.tree()).unwrap();

        let task = tokio::spawn(run_updater(link.clone(), values, Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        let first = link.tree().get("/Container1/TestVal1").unwrap().value().get();
        let second = link.tree().get("/Container1/TestVal2").unwrap().value().get();
        let (Variant::Int(a), Variant::Int(b)) = (first, second) else {
            panic!("counter not applied");
        };
        assert_eq!((b - a).rem_euclid(250), 1);
    }

    struct NeverHandshake;

    #[async_trait::async_trait]
    impl dslink_sdk::Handshaker for NeverHandshake {
        async fn handshake(&self) -> Result<dslink_sdk::Session, dslink_sdk::HandshakeError> {
            Err(dslink_sdk::HandshakeError::Rejected("offline".into()))
        }
    }
}
