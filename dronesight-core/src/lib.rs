//! 802.11 capture analysis: packet reassembly, topology and device classification.
//! Library only: callers feed parsed frames and read verdicts.

pub mod device;
pub mod frame;
pub mod graph;
pub mod mac;
pub mod packet;
pub mod parser;
pub mod rules;

pub use device::{ClassifiedDevice, Confidence, DeviceType, Source, Verdict};
pub use frame::{merge_separated, FrameRecord, FrameStats};
pub use graph::TopologyGraph;
pub use mac::{MacAddr, MacParseError};
pub use parser::{FrameParser, Layout, ReadError};
pub use rules::{RuleClassifier, RuleSet, VendorFallback};

// Reassembly and the worker pool that drives the concurrent variant.
pub mod concurrent;
pub mod pool;
pub mod reassembly;

pub use concurrent::ConcurrentPacketReassembler;
pub use pool::{PoolError, ThreadPool};
pub use reassembly::{PacketReassembler, Reassembler, DEFAULT_PACKET_THRESHOLD};

pub mod estimator;
pub mod features;
pub mod orchestrator;
pub mod persist;
pub mod sequence;

pub use estimator::{Dataset, Estimator, NearestCentroid};
pub use orchestrator::ClassificationOrchestrator;
pub use persist::ModelError;
pub use sequence::{MarkovModel, ObservationTransformer, SequenceModel, StandardScaler};
