//! Graceful shutdown: one cancel drains the server and every session.

use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keelson::codec::NullString;
use keelson::{
    bootstrap, start_loop, Callbacks, Config, Options, Session, State, StreamServer,
    StreamSession,
};

type S = StreamSession<String, String>;

const WAIT: Duration = Duration::from_secs(5);
const SESSIONS: usize = 5;

#[test]
fn cancel_closes_every_session_and_stops_the_server() {
    let lp = start_loop();

    let accepted = flume::unbounded::<()>();
    let closes = Arc::new(AtomicUsize::new(0));
    let (closed_tx, closed_rx) = flume::unbounded::<()>();

    let handler = {
        let accepted_tx = accepted.0.clone();
        let closes = Arc::clone(&closes);
        Callbacks::new()
            .on_message(|session: &S, input: String| session.send(input))
            .on_accept(move |session: &S| {
                session.start()?;
                let _ = accepted_tx.send(());
                Ok(())
            })
            .on_close(move |_session: &S| {
                closes.fetch_add(1, Ordering::SeqCst);
                let _ = closed_tx.send(());
                Ok(())
            })
    };

    let server = StreamServer::<String, String>::new(Options::default(), NullString, handler);
    let (addr_tx, addr_rx) = flume::bounded(1);
    {
        let server = server.clone();
        lp.execute(move || {
            server.start("127.0.0.1:0")?;
            let _ = addr_tx.send(server.local_addr());
            Ok(())
        })
        .unwrap();
    }
    let addr = addr_rx.recv_timeout(WAIT).unwrap().expect("server bound");

    // open five connections and wait until every session is started
    let clients: Vec<TcpStream> = (0..SESSIONS)
        .map(|_| TcpStream::connect(addr).unwrap())
        .collect();
    for _ in 0..SESSIONS {
        accepted.1.recv_timeout(WAIT).unwrap();
    }

    lp.cancel();

    // bootstrap returns cleanly once the loop has drained
    bootstrap(Config::empty()).unwrap();

    for _ in 0..SESSIONS {
        closed_rx.recv_timeout(WAIT).unwrap();
    }
    assert_eq!(closes.load(Ordering::SeqCst), SESSIONS);
    assert_eq!(server.state(), State::Stopped);

    drop(clients);
}
