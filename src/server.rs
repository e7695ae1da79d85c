use crate::context::TransactionContext;
use crate::dispatcher::Dispatcher;
use crate::verdict::Verdict;
use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpListener;

/// Longest accepted request line, in bytes.
const MAX_LINE_LENGTH: usize = 8192;
/// Most attributes accepted in one request.
const MAX_ATTRIBUTES: usize = 128;

/// Postfix policy delegation server.
pub struct PolicyServer {
    dispatcher: Arc<Dispatcher>,
}

impl PolicyServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub async fn run(&self, listen_address: &str) -> anyhow::Result<()> {
        log::info!("Starting policy server on: {}", listen_address);
        log::info!("Enabled plugins: {:?}", self.dispatcher.plugin_names());

        let listener = TcpListener::bind(listen_address).await?;
        self.serve(listener, tokio::signal::ctrl_c()).await
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    log::debug!("Connection from: {}", peer);

                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, dispatcher).await {
                            log::warn!("Connection from {} closed with error: {}", peer, e);
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Shutting down policy server");
                    return Ok(());
                }
            }
        }
    }
}

/// Serve policy requests on one connection until the client hangs up.
pub async fn handle_connection<S>(stream: S, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut attrs = HashMap::new();

    while let Some(line) = read_line(&mut reader, &mut buf).await? {
        if !line.is_empty() {
            if attrs.len() >= MAX_ATTRIBUTES {
                anyhow::bail!("request has more than {MAX_ATTRIBUTES} attributes");
            }
            parse_line(&line, &mut attrs);
            continue;
        }

        if attrs.is_empty() {
            continue;
        }

        let verdict = evaluate_request(&dispatcher, &attrs).await;
        writer
            .write_all(format!("action={}\n\n", verdict.action_line()).as_bytes())
            .await?;
        writer.flush().await?;
        attrs.clear();
    }

    if !attrs.is_empty() {
        log::debug!("Client disconnected with an unterminated request");
    }
    Ok(())
}

/// Next line without its terminator, `None` at end of stream.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> anyhow::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = (MAX_LINE_LENGTH + 1) as u64;
    if reader.take(limit).read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    if !buf.ends_with(b"\n") && buf.len() > MAX_LINE_LENGTH {
        anyhow::bail!("request line longer than {MAX_LINE_LENGTH} bytes");
    }

    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Parse a complete request (attribute lines, optional trailing blank line).
pub fn parse_request(text: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        parse_line(line, &mut attrs);
    }
    attrs
}

/// Read and parse a request saved to a file.
pub fn read_request_file(path: &str) -> anyhow::Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request file: {path}"))?;
    Ok(parse_request(&content))
}

/// Evaluate one parsed request; requests without a usable protocol state get
/// the dispatcher's default answer.
pub async fn evaluate_request(dispatcher: &Dispatcher, attrs: &HashMap<String, String>) -> Verdict {
    match TransactionContext::from_attributes(attrs) {
        Ok(ctx) => dispatcher.evaluate(&ctx).await,
        Err(e) => {
            log::warn!("Invalid policy request: {e:#}");
            dispatcher.default_verdict()
        }
    }
}

fn parse_line(line: &str, attrs: &mut HashMap<String, String>) {
    match line.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            attrs.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
        _ => log::warn!("Ignoring malformed request line: {}", line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ldap::tests::{sample_directory, BASE_DN};
    use crate::directory::ldap::LdapPool;
    use crate::plugins::AccessPolicyResolver;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn dispatcher() -> Arc<Dispatcher> {
        let pool = LdapPool::new(
            Arc::new(sample_directory()),
            BASE_DN,
            Duration::from_secs(5),
        );
        Arc::new(Dispatcher::new(
            vec![Box::new(AccessPolicyResolver::new())],
            Arc::new(pool),
            Verdict::dunno(),
        ))
    }

    fn request(sender: &str, recipient: &str) -> String {
        format!(
            "request=smtpd_access_policy\nprotocol_state=RCPT\nprotocol_name=ESMTP\n\
             client_address=192.0.2.10\nsender={sender}\nrecipient={recipient}\n\n"
        )
    }

    async fn exchange(input: String) -> String {
        let (mut client, server) = tokio::io::duplex(4096);
        let handle = tokio::spawn(handle_connection(server, dispatcher()));

        client.write_all(input.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        handle.await.unwrap().unwrap();
        output
    }

    #[test]
    fn test_parse_request() {
        let attrs = parse_request(
            "request=smtpd_access_policy\r\nprotocol_state=RCPT\r\nsender=a@b.c\r\nbogus line\r\n\r\nignored=1\r\n",
        );
        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs["protocol_state"], "RCPT");
        assert_eq!(attrs["sender"], "a@b.c");
        assert!(!attrs.contains_key("ignored"));
    }

    #[test]
    fn test_value_may_contain_equals_sign() {
        let attrs = parse_request("ccert_subject=CN=mx.example.com\n");
        assert_eq!(attrs["ccert_subject"], "CN=mx.example.com");
    }

    #[test]
    fn test_read_request_file() {
        let path = std::env::temp_dir().join(format!("mta-policyd-request-{}", std::process::id()));
        std::fs::write(&path, "protocol_state=RCPT\nsender=a@b.c\n\n").unwrap();
        let path = path.to_string_lossy().into_owned();

        let attrs = read_request_file(&path).unwrap();
        assert_eq!(attrs["sender"], "a@b.c");
        std::fs::remove_file(&path).unwrap();

        let err = read_request_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains(&path));
    }

    #[tokio::test]
    async fn test_multiple_requests_per_connection() {
        let mut input = request("outsider@remote.test", "members@example.com");
        input.push_str(&request("outsider@remote.test", "public@example.com"));

        let output = exchange(input).await;
        assert_eq!(
            output,
            "action=REJECT Not authorized\n\naction=DUNNO\n\n"
        );
    }

    #[tokio::test]
    async fn test_request_without_protocol_state_gets_default() {
        let output = exchange("sender=a@example.com\nrecipient=members@example.com\n\n".to_string()).await;
        assert_eq!(output, "action=DUNNO\n\n");
    }

    #[tokio::test]
    async fn test_stray_blank_lines_and_unterminated_request() {
        let mut input = "\n\n".to_string();
        input.push_str(&request("alice@example.com", "members@example.com"));
        input.push_str("protocol_state=RCPT\nsender=x@y.z\n");

        let output = exchange(input).await;
        assert_eq!(output, "action=DUNNO\n\n");
    }

    #[tokio::test]
    async fn test_overlong_line_closes_connection() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let input = format!(
            "protocol_state=RCPT\nsender={}",
            "a".repeat(MAX_LINE_LENGTH * 2)
        );
        client.write_all(input.as_bytes()).await.unwrap();

        assert!(handle_connection(server, dispatcher()).await.is_err());
    }

    #[tokio::test]
    async fn test_too_many_attributes_closes_connection() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut input = String::from("protocol_state=RCPT\n");
        for i in 0..MAX_ATTRIBUTES * 2 {
            input.push_str(&format!("x{i}=1\n"));
        }
        client.write_all(input.as_bytes()).await.unwrap();

        assert!(handle_connection(server, dispatcher()).await.is_err());
    }

    #[tokio::test]
    async fn test_long_values_within_limit_are_accepted() {
        let mut input = request("outsider@remote.test", "members@example.com");
        input.insert_str(0, &format!("ccert_subject={}\n", "c".repeat(4000)));
        let output = exchange(input).await;
        assert_eq!(output, "action=REJECT Not authorized\n\n");
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let server = PolicyServer::new(dispatcher());
        let handle = tokio::spawn(async move { server.serve(listener, stopped).await });

        let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();
        stream
            .write_all(request("outsider@remote.test", "members@example.com").as_bytes())
            .await
            .unwrap();
        let mut reply = vec![0u8; 64];
        let mut read = 0;
        while !reply[..read].ends_with(b"\n\n") {
            let n = stream.read(&mut reply[read..]).await.unwrap();
            assert!(n > 0);
            read += n;
        }
        assert_eq!(&reply[..read], b"action=REJECT Not authorized\n\n");

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
