//! End-to-end null-string echo over loopback.

use std::time::Duration;

use keelson::codec::NullString;
use keelson::{start_loop, Callbacks, Options, Session, StreamConnector, StreamServer, StreamSession};

type S = StreamSession<String, String>;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn echo_three_messages_in_order_then_close() {
    let server_loop = start_loop();
    let client_loop = start_loop();

    // echo server on an OS-assigned port
    let server = StreamServer::<String, String>::new(
        Options::default(),
        NullString,
        Callbacks::new().on_message(|session: &S, input: String| session.send(input)),
    );
    let (addr_tx, addr_rx) = flume::bounded(1);
    {
        let server = server.clone();
        server_loop
            .execute(move || {
                server.start("127.0.0.1:0")?;
                let _ = addr_tx.send(server.local_addr());
                Ok(())
            })
            .unwrap();
    }
    let addr = addr_rx.recv_timeout(WAIT).unwrap().expect("server bound");

    // client records every message and the close callback
    let (msg_tx, msg_rx) = flume::unbounded::<String>();
    let (close_tx, close_rx) = flume::bounded::<()>(1);
    let handler = Callbacks::new()
        .on_message(move |_session: &S, input: String| {
            let _ = msg_tx.send(input);
            Ok(())
        })
        .on_close(move |_session: &S| {
            let _ = close_tx.send(());
            Ok(())
        });

    let (session_tx, session_rx) = flume::bounded::<S>(1);
    client_loop
        .execute(move || {
            let connector = StreamConnector::new(Options::default(), NullString, handler);
            let session = connector.connect(&addr.to_string())?;
            session.start()?;
            session.send("hello".to_string())?;
            session.send("world".to_string())?;
            session.send(String::new())?;
            let _ = session_tx.send(session);
            Ok(())
        })
        .unwrap();

    let session = session_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(msg_rx.recv_timeout(WAIT).unwrap(), "hello");
    assert_eq!(msg_rx.recv_timeout(WAIT).unwrap(), "world");
    assert_eq!(msg_rx.recv_timeout(WAIT).unwrap(), "");

    // exactly three messages arrived
    assert!(msg_rx.recv_timeout(Duration::from_millis(200)).is_err());

    session.close().unwrap();
    close_rx.recv_timeout(WAIT).unwrap();
    assert!(!session.started());
    assert!(!session.connected());

    // on_close is delivered exactly once
    assert!(close_rx.recv_timeout(Duration::from_millis(200)).is_err());

    client_loop.cancel();
    server_loop.cancel();
}
