//! Black-box test of the public listener-tracking surface: an accept loop
//! that serves echo traffic, stops without closing its socket, and drains.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use moult::{Error, FlagSet, Network};

#[tokio::test]
async fn accept_loop_stops_and_drains() {
    let mut flags = FlagSet::new("test");
    let flag = flags.listener("svc", Network::Tcp, "127.0.0.1:0", "svc");
    let listener = flag.listen().await.unwrap();
    let addr = listener.local_addr();

    let serve = {
        let listener = listener.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(mut conn) => {
                        tokio::spawn(async move {
                            let mut buf = [0u8; 64];
                            loop {
                                match conn.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        if conn.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                            let _ = conn.close().await;
                        });
                    }
                    Err(Error::Stopped) => break,
                    Err(_) => {}
                }
            }
        })
    };

    // A live connection echoes.
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    // Stop, then wake the blocked accept with an inbound connection; the
    // loop must observe the stop and break rather than serve it.
    listener.stop().unwrap();
    let _wake = TcpStream::connect(addr).await.unwrap();
    timeout(Duration::from_secs(1), serve)
        .await
        .expect("serve loop should break after stop")
        .unwrap();

    // Only the echo connection is still in flight; releasing it finishes
    // the drain.
    assert_eq!(listener.active_connections(), 1);
    drop(client);
    timeout(Duration::from_secs(1), listener.wait())
        .await
        .expect("wait should finish once the connection closes");
    assert_eq!(listener.active_connections(), 0);
}
