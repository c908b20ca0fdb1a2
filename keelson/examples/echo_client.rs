//! Interactive echo client: each stdin line is sent to the echo server and
//! every reply is printed.

use std::io::BufRead;

use keelson::codec::NullString;
use keelson::{bootstrap, start_loop, Callbacks, Config, Options};
use keelson::{Session, StreamConnector, StreamSession};

fn main() -> keelson::Result<()> {
    keelson::trace::init("info");

    let lp = start_loop();
    lp.execute(|| {
        let connector = StreamConnector::<String, String>::new(
            Options::default(),
            NullString,
            Callbacks::new().on_message(
                |_session: &StreamSession<String, String>, input: String| {
                    println!("-> {input}");
                    Ok(())
                },
            ),
        );
        let session = connector.connect("127.0.0.1:8888")?;
        session.start()?;

        // stdin is read on a plain thread; send never blocks the loop
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if session.send(line.trim().to_string()).is_err() {
                    break;
                }
            }
        });
        Ok(())
    })?;
    bootstrap(Config::empty())
}
