use std::path::PathBuf;

use clap::Parser;
use weft_base::Config;
use weft_kvs::Op;
use weft_kvs_store::TreeObject;

/// Runs a single node against an in-memory content store and commits one
/// demonstration write, printing the resulting root. Illustrative: a real
/// deployment wires [`weft::Node`] to a [`weft_bootstrap::BootstrapTree`]
/// and a durable [`weft_kvs_store::ContentStore`] instead.
#[derive(Parser)]
struct Args {
    /// Optional TOML config file; falls back to [`Config::default`].
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> weft_base::Result<()> {
    let args = Args::parse();
    let config = match args.config {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    weft::init_tracing(&config);

    let mut node = weft::in_memory_node(config)?;
    let root = node.commit("startup", vec![Op::write("hello", TreeObject::Val(b"world".to_vec()))])?;
    tracing::info!(root = %root, "committed");
    println!("root: {root}");
    Ok(())
}
