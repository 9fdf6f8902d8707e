//! Scripted in-memory IMAP server for exercising the client side.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

/// Tag of a client command line (`A0001 LOGIN ...` gives `A0001`).
pub(crate) fn tag_of(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

/// Spawn a server on one half of a duplex pipe.
///
/// `handler` is called with every line the client sends (without CRLF) and
/// returns the raw bytes to answer with, or `None` to hang up. The join
/// handle yields every received line once the client disconnects.
pub(crate) fn spawn_server<F>(
    greeting: Option<&str>,
    mut handler: F,
) -> (DuplexStream, JoinHandle<Vec<String>>)
where
    F: FnMut(&str) -> Option<String> + Send + 'static,
{
    let (client, server) = tokio::io::duplex(64 * 1024);
    let greeting = greeting.map(|g| format!("{g}\r\n"));

    let handle = tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(server);
        let mut reader = BufReader::new(read);
        let mut received = Vec::new();

        if let Some(greeting) = greeting {
            if write.write_all(greeting.as_bytes()).await.is_err() {
                return received;
            }
        }

        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            let reply = handler(&line);
            received.push(line);
            match reply {
                Some(reply) => {
                    if write.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        received
    });

    (client, handle)
}

/// Answers LOGIN and LOGOUT; everything else goes to `handler`.
pub(crate) fn logged_in_server<F>(mut handler: F) -> (DuplexStream, JoinHandle<Vec<String>>)
where
    F: FnMut(&str, &str) -> String + Send + 'static,
{
    spawn_server(None, move |line| {
        let tag = tag_of(line);
        let command = line[tag.len()..].trim_start();
        if command.starts_with("LOGIN") {
            Some(format!("{tag} OK LOGIN completed\r\n"))
        } else if command.starts_with("LOGOUT") {
            Some(format!("* BYE logging out\r\n{tag} OK LOGOUT completed\r\n"))
        } else {
            Some(handler(tag, command))
        }
    })
}

/// Authenticated session on a scripted server.
pub(crate) async fn session_for(
    stream: DuplexStream,
) -> async_imap::Session<DuplexStream> {
    async_imap::Client::new(stream)
        .login("tester", "secret")
        .await
        .map_err(|(e, _)| e)
        .expect("login against scripted server")
}
