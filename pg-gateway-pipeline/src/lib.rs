//! Wires `pg-gateway-core`'s building blocks to `pg-gateway-llm` behind two
//! oracles and one state machine: C8 (drafting/sanity oracles) and C9 (the
//! query pipeline itself).

pub mod oracles;
pub mod pipeline;

pub use oracles::{ResultSanityOracle, SqlDraftingOracle};
pub use pipeline::{QueryFault, QueryPipeline};
