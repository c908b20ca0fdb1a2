//! Null-terminated string echo server.
//!
//! Run with `cargo run --example echo_server`, then point the echo client
//! (or `nc 127.0.0.1 8888`) at it. An optional first argument is echoed
//! back as a prefix on every message.

use keelson::codec::NullString;
use keelson::{bootstrap, start_loop, Callbacks, Config, Options};
use keelson::{Session, StreamServer, StreamSession};

fn main() -> keelson::Result<()> {
    keelson::trace::init("info");

    let prefix = std::env::args()
        .nth(1)
        .map(|name| format!("{name}: "))
        .unwrap_or_default();

    let lp = start_loop();
    lp.execute(move || {
        let server = StreamServer::<String, String>::new(
            Options::default(),
            NullString,
            Callbacks::new().on_message(
                move |session: &StreamSession<String, String>, input: String| {
                    session.send(format!("{prefix}{input}"))
                },
            ),
        );
        server.start("127.0.0.1:8888")
    })?;
    bootstrap(Config::empty())
}
