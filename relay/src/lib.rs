//! The off-chain half of the inter-chain channel: one duplex peer link per
//! remote relay, translating proven peer-chain activity into signed local
//! chain transactions and shipping local activity the other way.
//!
//! Transaction signing and chain RPC live behind [client::ChainClient];
//! everything here is transport, liveness, and ordering.

pub mod client;
pub mod logging;
pub mod p2p;
pub mod settings;
