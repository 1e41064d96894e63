pub mod cache;
pub mod codec;
pub mod config;
pub mod format;
pub mod input;
pub mod matcher;
pub mod render;
pub mod scan;
pub mod session;
pub mod status;
pub mod tree;

pub use cache::{DecodeCache, InputDecoderTable, InputMapper, SingleInput, SliceMapper};
pub use codec::{get_codec, CodecId};
pub use config::ScanConfig;
pub use format::{BlockFormat, BytePattern, DecodeError, FormatPlugin, FormatSet, RawData};
pub use input::{InputRange, InputSource, RangeReader};
pub use matcher::FormatMatcher;
pub use render::{export_json, render_tree, RenderSession};
pub use scan::{scan, ScanError, ScanHandle, StopOutcome};
pub use session::DecodeSession;
pub use status::{LogSink, NullSink, Progress, StatusSink};
pub use tree::{NodeId, NodeKey, NodeKind, NodeView, ResultTree, Value, View};
