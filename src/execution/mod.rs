// Tick normalization, candle aggregation, positions and order execution
pub mod aggregator;
pub mod candle_buffer;
pub mod executor;
pub mod normalizer;
pub mod position_manager;
pub mod price_feed;

pub use aggregator::{CandleAggregator, IngestOutcome};
pub use candle_buffer::CandleBuffer;
pub use executor::{
    ExecutionDispatcher, ExecutionGateway, ExecutionReport, GatewayError, OrderRequest,
    PaperGateway,
};
pub use normalizer::TickError;
pub use position_manager::{ExitReason, Position, PositionManager, RiskEvent, RiskParams};
pub use price_feed::PriceFeedManager;
