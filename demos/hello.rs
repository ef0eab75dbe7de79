/*! Minimal responder.

Run it, then point a web server at it, e.g. nginx:

```text
location / {
    fastcgi_pass 127.0.0.1:9000;
    include fastcgi_params;
}
```

`RUST_LOG=debug cargo run --example hello`
*/
use std::io::Write;

use fcgi_engine::{Application, FCGIAddr, FcgiRequest, Manager, ServerConfig};

struct Hello;

impl Application for Hello {
    fn respond(&self, req: &mut FcgiRequest) -> bool {
        let method = req
            .param(b"REQUEST_METHOD")
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .unwrap_or_default();
        let uri = req
            .param(b"REQUEST_URI")
            .map(|u| String::from_utf8_lossy(u).into_owned())
            .unwrap_or_default();
        write!(
            req.stdout(),
            "Content-Type: text/plain\r\n\r\nHello! You sent {} {}\r\n",
            method,
            uri
        )
        .is_ok()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    let addr: FCGIAddr = "127.0.0.1:9000".parse()?;
    let listener = Manager::<Hello>::bind(&addr).await?;
    let manager = Manager::new(Hello, ServerConfig::default());
    manager
        .run_until(listener, async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;
    Ok(())
}
