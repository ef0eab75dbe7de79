/*! Async FastCGI (v1) application server engine.

A web server connects to us, multiplexes requests over the connection and
streams each request's environment and body. This crate handles the record
framing, the per-request bookkeeping and the management queries; the
application only implements [`Application::respond`] against a complete
[`FcgiRequest`].

Callbacks run on blocking worker threads, bounded by
[`ServerConfig::workers`], so they may use plain blocking `std::io::Write`
on the request's stdout/stderr without stalling the connection drivers.

```no_run
use std::io::Write;
use fcgi_engine::{Application, FCGIAddr, FcgiRequest, Manager, ServerConfig};

struct Hello;

impl Application for Hello {
    fn respond(&self, req: &mut FcgiRequest) -> bool {
        write!(req.stdout(), "Content-Type: text/plain\r\n\r\nHello!").is_ok()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr: FCGIAddr = "127.0.0.1:9000".parse()?;
    let listener = Manager::<Hello>::bind(&addr).await?;
    let manager = Manager::new(Hello, ServerConfig::default());
    manager.run(listener).await?;
    Ok(())
}
```
*/

mod connection;
pub mod error;
pub mod fastcgi;
mod manager;
mod request;
pub mod stream;
mod transceiver;

pub use crate::error::{Error, ProtocolError};
pub use crate::fastcgi::{ProtocolStatus, RecordType, Role};
pub use crate::manager::{Manager, ServerConfig};
pub use crate::request::{Application, FcgiRequest, FullId, Message, OutputSink};
pub use crate::stream::{FCGIAddr, Listener, Stream};
pub use crate::transceiver::Transceiver;
