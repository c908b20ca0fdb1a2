//! End-to-end echo over the framed transport, with handshake metadata.

use std::time::Duration;

use keelson::codec::TextFrame;
use keelson::{
    start_loop, Callbacks, FramedConnector, FramedServer, FramedSession, Headers, Options,
    Session,
};

type S = FramedSession<String, String>;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn framed_echo_with_path_and_headers() {
    let server_loop = start_loop();
    let client_loop = start_loop();

    // the server records what each handshake negotiated
    let (meta_tx, meta_rx) = flume::bounded::<(String, Headers)>(1);
    let server_handler = Callbacks::new()
        .on_message(|session: &S, input: String| session.send(input))
        .on_accept(move |session: &S| {
            let _ = meta_tx.send((session.path().to_string(), session.headers().clone()));
            session.start()
        });

    let server = FramedServer::<String, String>::new(Options::default(), TextFrame, server_handler);
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

    let (msg_tx, msg_rx) = flume::unbounded::<String>();
    let (close_tx, close_rx) = flume::bounded::<()>(1);
    let client_handler = Callbacks::new()
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
            let mut headers = Headers::new();
            headers.insert("client".into(), "framed-test".into());
            let connector = FramedConnector::new(Options::default(), TextFrame, client_handler);
            let session = connector.connect(&format!("{addr}/feed"), headers)?;
            assert_eq!(session.path(), "/feed");
            session.start()?;
            session.send("ping".to_string())?;
            session.send(String::new())?;
            let _ = session_tx.send(session);
            Ok(())
        })
        .unwrap();

    // the server saw the negotiated path and headers
    let (path, headers) = meta_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(path, "/feed");
    assert_eq!(headers.get("client").map(String::as_str), Some("framed-test"));

    // echoes arrive in order; an empty frame is a value, not EOF
    let session = session_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(msg_rx.recv_timeout(WAIT).unwrap(), "ping");
    assert_eq!(msg_rx.recv_timeout(WAIT).unwrap(), "");

    session.close().unwrap();
    close_rx.recv_timeout(WAIT).unwrap();

    client_loop.cancel();
    server_loop.cancel();
}
