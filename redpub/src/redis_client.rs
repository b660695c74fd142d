//! Blocking Redis connections for pipelined `PUBLISH`, built on the `redis`
//! crate.
//!
//! `AUTH` and `SELECT` are sent explicitly after connecting so their
//! failures map onto [`PublishError::Auth`] and [`PublishError::Server`].
//! A batch is one [`redis::pipe`] of `PUBLISH` commands. The client reads
//! every reply before surfacing the first error reply, so the connection
//! stays in sync with the server after a failed batch.

use std::time::Duration;

use redis::{Client, ConnectionAddr, ConnectionInfo, ErrorKind, RedisConnectionInfo, RedisError};
use tracing::debug;

use crate::config::SinkConfig;
use crate::connection::{Connection, Connector, Message};
use crate::error::{PublishError, RedpubError, Result};

/// How long `close` waits for the server to acknowledge `QUIT`.
const QUIT_TIMEOUT: Duration = Duration::from_millis(250);

/// Opens [`RedisConnection`]s to one server.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    host: String,
    port: u16,
    db: u32,
    password: Option<String>,
    connect_timeout: Duration,
}

impl RedisConnector {
    /// Creates a connector for `host:port` using database 0 and no password.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            db: 0,
            password: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Builds a connector from the sink configuration. The flush timeout
    /// also bounds connecting and the handshake.
    pub fn from_config(config: &SinkConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            db: config.db_number,
            password: config.password.clone(),
            connect_timeout: config.flush.timeout,
        }
    }

    /// Sets the database selected after connecting.
    #[must_use]
    pub fn with_db(mut self, db: u32) -> Self {
        self.db = db;
        self
    }

    /// Sets the password sent with `AUTH`.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the connect and handshake timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Returns `host:port`.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    // Credentials and database stay out of the client's connection info:
    // the handshake below sends them itself.
    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo::default(),
        }
    }

    fn connect(&self) -> Result<redis::Connection> {
        let connect_err = |source| PublishError::Connect {
            endpoint: self.endpoint(),
            source,
        };
        let client = Client::open(self.connection_info()).map_err(connect_err)?;
        let connection = client
            .get_connection_with_timeout(self.connect_timeout)
            .map_err(connect_err)?;
        set_timeouts(&connection, self.connect_timeout)?;
        Ok(connection)
    }
}

impl Connector for RedisConnector {
    type Connection = RedisConnection;

    fn open(&self) -> Result<RedisConnection> {
        let mut inner = self.connect()?;

        if let Some(password) = &self.password {
            redis::cmd("AUTH")
                .arg(password.as_str())
                .exec(&mut inner)
                .map_err(|e| handshake_error(e, self.connect_timeout, |message| PublishError::Auth { message }))?;
        }

        if self.db != 0 {
            redis::cmd("SELECT")
                .arg(self.db)
                .exec(&mut inner)
                .map_err(|e| handshake_error(e, self.connect_timeout, |message| PublishError::Server { message }))?;
        }

        debug!(endpoint = %self.endpoint(), db = self.db, "connected to redis");
        Ok(RedisConnection { inner })
    }
}

/// A live connection to a Redis server.
pub struct RedisConnection {
    inner: redis::Connection,
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection").finish_non_exhaustive()
    }
}

impl Connection for RedisConnection {
    fn pipeline_publish(&mut self, messages: &[Message], timeout: Duration) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for message in messages {
            pipe.publish(message.channel.as_str(), message.payload.as_str());
        }

        set_timeouts(&self.inner, timeout)?;
        let receivers: Vec<i64> = pipe
            .query(&mut self.inner)
            .map_err(|e| publish_error(e, timeout))?;
        debug!(commands = messages.len(), receivers = receivers.iter().sum::<i64>(), "pipeline published");
        Ok(())
    }

    fn close(mut self) {
        if set_timeouts(&self.inner, QUIT_TIMEOUT).is_ok() {
            let _ = redis::cmd("QUIT").exec(&mut self.inner);
        }
    }
}

/// Bounds every socket read and write on `connection` by `timeout`.
fn set_timeouts(connection: &redis::Connection, timeout: Duration) -> Result<()> {
    connection
        .set_read_timeout(Some(timeout))
        .and_then(|()| connection.set_write_timeout(Some(timeout)))
        .map_err(|source| PublishError::Redis { source }.into())
}

/// Renders a server error reply as `CODE detail`, the way Redis prints it.
fn server_message(e: &RedisError) -> String {
    match (e.code(), e.detail()) {
        (Some(code), Some(detail)) => format!("{code} {detail}"),
        (Some(code), None) => code.to_string(),
        _ => e.to_string(),
    }
}

fn handshake_error(e: RedisError, timeout: Duration, rejected: impl FnOnce(String) -> PublishError) -> RedpubError {
    if e.code().is_some() || e.kind() == ErrorKind::AuthenticationFailed {
        rejected(server_message(&e)).into()
    } else {
        publish_error(e, timeout)
    }
}

fn publish_error(e: RedisError, timeout: Duration) -> RedpubError {
    let err = if e.is_timeout() {
        PublishError::Timeout { timeout }
    } else if e.is_connection_dropped() {
        PublishError::Closed
    } else if e.code().is_some() {
        PublishError::Server {
            message: server_message(&e),
        }
    } else if matches!(e.kind(), ErrorKind::TypeError | ErrorKind::ParseError) {
        PublishError::Protocol { reason: e.to_string() }
    } else {
        PublishError::Redis { source: e }
    };
    err.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};

    /// Reads one RESP array of bulk strings, the only request shape the
    /// client sends.
    fn read_request(reader: &mut BufReader<TcpStream>) -> Option<Vec<String>> {
        fn header(reader: &mut BufReader<TcpStream>, kind: u8) -> Option<usize> {
            let mut line = String::new();
            if reader.read_line(&mut line).ok()? == 0 {
                return None;
            }
            let line = line.trim_end();
            assert_eq!(line.as_bytes()[0], kind, "unexpected request line {line:?}");
            line[1..].parse().ok()
        }

        let count = header(reader, b'*')?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            let len = header(reader, b'$')?;
            let mut data = vec![0; len + 2];
            reader.read_exact(&mut data).ok()?;
            data.truncate(len);
            args.push(String::from_utf8(data).unwrap());
        }
        Some(args)
    }

    /// Accepts one connection and answers each command with `respond`
    /// (`None` means stay silent). Returns every command received.
    fn fake_server<F>(respond: F) -> (u16, JoinHandle<Vec<Vec<String>>>)
    where
        F: Fn(&[String]) -> Option<Vec<u8>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut seen = Vec::new();

            while let Some(args) = read_request(&mut reader) {
                let quit = args[0] == "QUIT";
                let reply = if quit { Some(b"+OK\r\n".to_vec()) } else { respond(&args) };
                if let Some(bytes) = reply {
                    let _ = writer.write_all(&bytes);
                }
                seen.push(args);
                if quit {
                    break;
                }
            }
            seen
        });
        (port, handle)
    }

    fn publish_ok(args: &[String]) -> Option<Vec<u8>> {
        match args[0].as_str() {
            "PUBLISH" => Some(b":1\r\n".to_vec()),
            _ => Some(b"+OK\r\n".to_vec()),
        }
    }

    fn messages() -> Vec<Message> {
        vec![
            Message::new("app.log", r#"{"seq":0}"#),
            Message::new("app.log", r#"{"seq":1}"#),
            Message::new("sys", r#"{"seq":2}"#),
        ]
    }

    #[test]
    fn test_pipeline_publish() {
        let (port, server) = fake_server(publish_ok);
        let connector = RedisConnector::new("127.0.0.1", port);

        let mut connection = connector.open().unwrap();
        connection.pipeline_publish(&messages(), Duration::from_secs(2)).unwrap();
        connection.close();

        let seen = server.join().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], vec!["PUBLISH", "app.log", r#"{"seq":0}"#]);
        assert_eq!(seen[2], vec!["PUBLISH", "sys", r#"{"seq":2}"#]);
        assert_eq!(seen[3], vec!["QUIT"]);
    }

    #[test]
    fn test_empty_batch_sends_nothing() {
        let (port, server) = fake_server(publish_ok);
        let mut connection = RedisConnector::new("127.0.0.1", port).open().unwrap();
        connection.pipeline_publish(&[], Duration::from_secs(2)).unwrap();
        connection.close();

        assert_eq!(server.join().unwrap(), vec![vec!["QUIT".to_string()]]);
    }

    #[test]
    fn test_handshake_auth_and_select() {
        let (port, server) = fake_server(publish_ok);
        let connector = RedisConnector::new("127.0.0.1", port)
            .with_password("secret")
            .with_db(2);

        let connection = connector.open().unwrap();
        connection.close();

        let seen = server.join().unwrap();
        assert_eq!(seen[0], vec!["AUTH", "secret"]);
        assert_eq!(seen[1], vec!["SELECT", "2"]);
    }

    #[test]
    fn test_auth_rejected() {
        let (port, server) = fake_server(|_| Some(b"-WRONGPASS invalid password\r\n".to_vec()));
        let connector = RedisConnector::new("127.0.0.1", port).with_password("nope");

        let err = connector.open().unwrap_err();
        assert!(matches!(err, RedpubError::Publish(PublishError::Auth { ref message }) if message.contains("WRONGPASS")));
        server.join().unwrap();
    }

    #[test]
    fn test_select_rejected() {
        let (port, server) = fake_server(|_| Some(b"-ERR DB index is out of range\r\n".to_vec()));
        let connector = RedisConnector::new("127.0.0.1", port).with_db(99);

        let err = connector.open().unwrap_err();
        assert!(matches!(err, RedpubError::Publish(PublishError::Server { ref message }) if message.contains("out of range")));
        server.join().unwrap();
    }

    #[test]
    fn test_error_reply_fails_batch_after_reading_all() {
        let (port, server) = fake_server(|args| match args[1].as_str() {
            "sys" => Some(b"-ERR boom\r\n".to_vec()),
            _ => Some(b":1\r\n".to_vec()),
        });
        let mut connection = RedisConnector::new("127.0.0.1", port).open().unwrap();

        let mut batch = messages();
        batch.swap(1, 2);
        let err = connection.pipeline_publish(&batch, Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, RedpubError::Publish(PublishError::Server { ref message }) if message == "ERR boom"));

        // Every reply was consumed, so the connection is still in sync.
        connection
            .pipeline_publish(&[Message::new("app.log", "{}")], Duration::from_secs(2))
            .unwrap();
        connection.close();
        assert_eq!(server.join().unwrap().len(), 5);
    }

    #[test]
    fn test_non_integer_reply_is_protocol_error() {
        let (port, server) = fake_server(|args| match args[0].as_str() {
            "PUBLISH" => Some(b"$3\r\nfoo\r\n".to_vec()),
            _ => Some(b"+OK\r\n".to_vec()),
        });
        let mut connection = RedisConnector::new("127.0.0.1", port).open().unwrap();

        let err = connection
            .pipeline_publish(&[Message::new("ch", "{}")], Duration::from_secs(2))
            .unwrap_err();
        assert!(matches!(err, RedpubError::Publish(PublishError::Protocol { .. })));

        connection.close();
        server.join().unwrap();
    }

    #[test]
    fn test_silent_server_times_out() {
        let (port, server) = fake_server(|args| match args[0].as_str() {
            "PUBLISH" => None,
            _ => Some(b"+OK\r\n".to_vec()),
        });
        let mut connection = RedisConnector::new("127.0.0.1", port).open().unwrap();

        let err = connection
            .pipeline_publish(&messages(), Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, RedpubError::Publish(PublishError::Timeout { .. })));

        drop(connection);
        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = RedisConnector::new("127.0.0.1", port)
            .with_connect_timeout(Duration::from_millis(200))
            .open()
            .unwrap_err();
        assert!(matches!(err, RedpubError::Publish(PublishError::Connect { .. })));
    }

    #[test]
    fn test_from_config() {
        let config = SinkConfig::from_json_str(r#"{"host": "cache", "port": 6380, "db_number": 3}"#).unwrap();
        let connector = RedisConnector::from_config(&config);
        assert_eq!(connector.endpoint(), "cache:6380");
        assert_eq!(connector.db, 3);
        assert!(matches!(connector.connection_info().addr, ConnectionAddr::Tcp(ref host, 6380) if host == "cache"));
    }
}
