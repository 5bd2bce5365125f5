pub mod http;
pub mod local_file;
pub mod sink;
pub mod stream_key;

pub use http::{AuthMode, BodyCompression, HttpSink, HttpSinkConfig};
pub use local_file::{FileFormat, LocalFileSink, LocalFileSinkConfig};
pub use sink::Sink;
pub use stream_key::stream_key_of;
