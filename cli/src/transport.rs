//! Message feed
//!
//! The feed is a stream of newline separated JSON envelopes:
//!
//! ```json
//! {"message": "run", "timestamp": 1700000000000}
//! ```
//!
//! Envelopes older than the session are history and are ignored. Accepted
//! messages are queued for the animation thread. When the feed ends the queue
//! is closed, so the messages already queued are still shown.

use std::{
    borrow::Cow,
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use serde::Deserialize;
use stranger_wall::{QueueFull, Request, RequestSender};
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, BufReader};

/// Where messages come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Standard input of the process
    Stdin,
    /// TCP server streaming envelopes, as `host:port`
    Tcp(String),
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(endpoint: &str) -> Result<Self, Self::Err> {
        let endpoint = endpoint.trim();
        if endpoint.eq_ignore_ascii_case("stdin") || endpoint == "-" {
            return Ok(Self::Stdin);
        }

        let address = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
        if let Some((scheme, _)) = address.split_once("://") {
            anyhow::bail!("unsupported message feed scheme {scheme:?}");
        }
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Tcp(address.to_owned()))
            }
            _ => anyhow::bail!("message feed endpoint {endpoint:?} is not `stdin` or `host:port`"),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => f.write_str("stdin"),
            Self::Tcp(address) => write!(f, "tcp://{address}"),
        }
    }
}

/// A single feed line
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct Envelope<'a> {
    /// Borrowed from the line unless it had escape sequences
    #[serde(borrow)]
    pub message: Cow<'a, str>,
    /// Milliseconds since the unix epoch
    #[serde(default)]
    pub timestamp: Option<u64>,
}

impl Envelope<'_> {
    /// Whether the envelope was posted before `since` (ms since the epoch)
    pub fn is_stale(&self, since: u64) -> bool {
        self.timestamp.is_some_and(|timestamp| timestamp < since)
    }
}

/// Parse one feed line, decoding escape sequences in strings
pub fn parse_envelope(line: &str) -> Result<Envelope<'_>, serde_json_core::de::Error> {
    // unescaped text is never longer than its escaped form
    let mut unescaped = vec![0; line.len()];
    serde_json_core::from_str_escaped(line, &mut unescaped).map(|(envelope, _)| envelope)
}

/// Current wall clock time in milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Connect to the source and queue incoming messages until it closes
///
/// A feed that ends cleanly closes the queue and returns `Ok`. Read and
/// connection failures are returned as errors.
pub async fn run<const SIZE: usize>(
    source: Source,
    since: u64,
    requests: RequestSender<'static, SIZE>,
) -> anyhow::Result<()> {
    let queued = match &source {
        Source::Stdin => {
            log::debug!("message feed established");
            feed(BufReader::new(tokio::io::stdin()), since, requests).await?
        }
        Source::Tcp(address) => {
            let stream = tokio::net::TcpStream::connect(address)
                .await
                .with_context(|| format!("unable to connect to the message feed {source}"))?;
            log::debug!("message feed established");
            feed(BufReader::new(stream), since, requests).await?
        }
    };
    log::debug!("message feed {source} closed after {queued} messages");
    Ok(())
}

/// Queue every fresh message of `reader` and close the queue at its end
pub async fn feed<R, const SIZE: usize>(
    reader: R,
    since: u64,
    requests: RequestSender<'_, SIZE>,
) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let queued = pump(reader, since, requests).await?;
    requests.close();
    Ok(queued)
}

/// Queue every fresh message read from `reader`, returns the number of queued messages
pub async fn pump<R, const SIZE: usize>(
    reader: R,
    since: u64,
    requests: RequestSender<'_, SIZE>,
) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut queued = 0;
    while let Some(line) = lines.next_line().await.context("message feed read failed")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let envelope = match parse_envelope(line) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::warn!("skipping malformed envelope {line:?}: {err}");
                continue;
            }
        };
        if envelope.is_stale(since) {
            log::trace!("skipping message posted before this session");
            continue;
        }

        log::info!("Message received: {}", envelope.message);
        match requests.try_send(Request::present(&envelope.message)) {
            Ok(()) => queued += 1,
            Err(QueueFull(request)) => {
                log::warn!("request queue is full, dropping {:?}", request.text());
            }
        }
    }
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use stranger_wall::RequestQueue;

    use super::*;

    #[test]
    fn test_parse_source() {
        assert_eq!("stdin".parse::<Source>().unwrap(), Source::Stdin);
        assert_eq!("STDIN".parse::<Source>().unwrap(), Source::Stdin);
        assert_eq!(
            "tcp://127.0.0.1:7070".parse::<Source>().unwrap(),
            Source::Tcp("127.0.0.1:7070".to_owned())
        );
        assert_eq!(
            "feed.local:9000".parse::<Source>().unwrap(),
            Source::Tcp("feed.local:9000".to_owned())
        );
        assert!("https://example.firebaseio.com".parse::<Source>().is_err());
        assert!("tcp://nohost".parse::<Source>().is_err());
        assert!(":7070".parse::<Source>().is_err());
    }

    #[test]
    fn test_parse_envelope() {
        let envelope = parse_envelope(r#"{"message":"run","timestamp":42}"#).unwrap();
        assert_eq!(envelope.message, "run");
        assert_eq!(envelope.timestamp, Some(42));
        assert!(envelope.is_stale(43));
        assert!(!envelope.is_stale(42));

        let envelope = parse_envelope(r#"{"message":"right here"}"#).unwrap();
        assert_eq!(envelope.timestamp, None);
        assert!(!envelope.is_stale(u64::MAX));

        assert!(parse_envelope("run").is_err());
        assert!(parse_envelope(r#"{"timestamp":1}"#).is_err());
    }

    #[test]
    fn test_parse_escaped_envelope() {
        let envelope = parse_envelope(r#"{"message":"\u0041B"}"#).unwrap();
        assert_eq!(envelope.message, "AB");

        let envelope = parse_envelope(r#"{"message":"say \"run\"\n"}"#).unwrap();
        assert_eq!(envelope.message, "say \"run\"\n");

        let envelope = parse_envelope(r#"{"message":"plain"}"#).unwrap();
        assert!(matches!(envelope.message, Cow::Borrowed("plain")));

        assert!(parse_envelope(r#"{"message":"\u00zz"}"#).is_err());
    }

    #[tokio::test]
    async fn test_pump_queues_fresh_messages() {
        static QUEUE: RequestQueue<4> = RequestQueue::new();

        let feed: &[u8] = b"{\"message\":\"old\",\"timestamp\":1}\n\
            not json\n\
            \n\
            {\"message\":\"hello\",\"timestamp\":100}\n\
            {\"message\":\"world\"}\n";
        let queued = pump(feed, 50, QUEUE.sender()).await.unwrap();

        assert_eq!(queued, 2);
        assert_eq!(QUEUE.try_receive(), Some(Request::present("hello")));
        assert_eq!(QUEUE.try_receive(), Some(Request::present("world")));
        assert_eq!(QUEUE.try_receive(), None);
        assert!(!QUEUE.is_closed());
    }

    #[tokio::test]
    async fn test_feed_end_keeps_queued_messages() {
        static QUEUE: RequestQueue<4> = RequestQueue::new();

        let feed_lines: &[u8] = b"{\"message\":\"hi there\"}\n{\"message\":\"\\u0041B\"}\n";
        let queued = feed(feed_lines, 0, QUEUE.sender()).await.unwrap();

        assert_eq!(queued, 2);
        assert!(QUEUE.is_closed());
        assert!(!QUEUE.is_drained());
        assert_eq!(QUEUE.try_receive(), Some(Request::present("hi there")));
        assert_eq!(QUEUE.try_receive(), Some(Request::present("AB")));
        assert!(QUEUE.is_drained());
    }
}
