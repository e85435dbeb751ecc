use bytes::{Bytes, BytesMut};
use std::{future::Future, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{Instant, timeout},
};
use tracing::debug;

use super::scram::{self, ScramClient};
use super::wire::{
    self, AuthRequest, TERMINATE, build_password_message, build_query_message,
    build_sasl_initial_response, build_sasl_response, build_startup_message, md5_password,
    peek_backend,
};
use crate::engine::{ConnectTarget, QueryOutput};
use crate::errors::BackendError;

const APPLICATION_NAME: &str = "pgkeeper";

// -----------------------------------------------------------------------------
// ----- PgConnection ----------------------------------------------------------

/// One authenticated server connection speaking the simple-query protocol.
///
/// Any transport-level failure marks the connection broken; a broken
/// connection is never handed back to the idle queue.
#[derive(Debug)]
pub struct PgConnection {
    stream: TcpStream,
    buffer: BytesMut,
    server_version: Option<String>,
    opened_at: Instant,
    broken: bool,
}

impl PgConnection {
    /// Connect and authenticate, all within `connect_timeout`.
    pub async fn connect(target: &ConnectTarget, connect_timeout: Duration) -> Result<Self, BackendError> {
        timeout(connect_timeout, Self::connect_inner(target))
            .await
            .map_err(|_| BackendError::Timeout(connect_timeout))?
    }

    async fn connect_inner(target: &ConnectTarget) -> Result<Self, BackendError> {
        let stream = TcpStream::connect(target.addr()).await?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            buffer: BytesMut::with_capacity(8192),
            server_version: None,
            opened_at: Instant::now(),
            broken: false,
        };
        conn.startup(target).await?;

        debug!(
            peer = ?conn.peer_addr().ok(),
            server_version = conn.server_version.as_deref().unwrap_or("unknown"),
            "backend connection ready"
        );
        Ok(conn)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Run `sql` with the simple-query protocol and collect its text rows.
    /// With several statements, the last result set wins.
    pub async fn simple_query(&mut self, sql: &str) -> Result<QueryOutput, BackendError> {
        if self.broken {
            return Err(BackendError::Closed("connection is broken"));
        }
        let outcome = self.simple_query_inner(sql).await;
        self.track(outcome)
    }

    /// Send Terminate and shut the socket down.
    pub async fn terminate(mut self) -> Result<(), BackendError> {
        if self.broken {
            return Ok(());
        }
        self.send(&TERMINATE).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // ----- Private -----------------------------------------------------------

    async fn startup(&mut self, target: &ConnectTarget) -> Result<(), BackendError> {
        let startup = build_startup_message(&target.user, &target.database, APPLICATION_NAME);
        self.send(&startup).await?;

        let password = target.password_exposed();
        let mut answered = false;
        let mut sasl: Option<ScramClient> = None;

        loop {
            let (tag, body) = self.next_frame().await?;

            match tag {
                b'R' => {
                    let request = wire::parse_auth_request(&body)?;
                    let response = match request {
                        AuthRequest::Ok => continue,
                        AuthRequest::SaslContinue(server_first) => {
                            let client = sasl
                                .as_mut()
                                .ok_or_else(|| BackendError::protocol("SASL continue before SASL start"))?;
                            build_sasl_response(&client.client_final(password, server_first)?)
                        }
                        AuthRequest::SaslFinal(server_final) => {
                            let client = sasl
                                .as_ref()
                                .ok_or_else(|| BackendError::protocol("SASL final before SASL start"))?;
                            client.verify_server_final(server_final)?;
                            continue;
                        }
                        _ if answered => {
                            return Err(BackendError::protocol("backend requested password twice"));
                        }
                        AuthRequest::Cleartext | AuthRequest::Md5(_) | AuthRequest::Sasl(_)
                            if password.is_empty() =>
                        {
                            return Err(BackendError::rejected(
                                "backend requested password but none configured",
                            ));
                        }
                        AuthRequest::Cleartext => build_password_message(password),
                        AuthRequest::Md5(salt) => {
                            build_password_message(&md5_password(&target.user, password, salt))
                        }
                        AuthRequest::Sasl(mechanisms) => {
                            if !mechanisms.contains(&scram::MECHANISM) {
                                return Err(BackendError::rejected(format!(
                                    "no supported SASL mechanism offered: {mechanisms:?}"
                                )));
                            }
                            let client = sasl.insert(ScramClient::new());
                            build_sasl_initial_response(scram::MECHANISM, &client.client_first())
                        }
                        AuthRequest::Other(code) => return Err(BackendError::UnsupportedAuth(code)),
                    };

                    self.send(&response).await?;
                    answered = true;
                }
                b'S' => self.record_parameter(&body)?,
                b'E' => return Err(wire::parse_error_response(&body)?),
                b'Z' => return Ok(()),
                // BackendKeyData, NoticeResponse, NegotiateProtocolVersion
                _ => {}
            }
        }
    }

    async fn simple_query_inner(&mut self, sql: &str) -> Result<QueryOutput, BackendError> {
        self.send(&build_query_message(sql)).await?;

        let mut output = QueryOutput::default();
        let mut server_error = None;

        loop {
            let (tag, body) = self.next_frame().await?;

            match tag {
                b'T' => {
                    output.columns = wire::parse_row_description(&body)?;
                    output.rows.clear();
                }
                b'D' => output.rows.push(wire::parse_data_row(&body)?),
                b'C' => output.command_tag = Some(wire::parse_command_complete(&body)?),
                b'E' => server_error = Some(wire::parse_error_response(&body)?),
                b'S' => self.record_parameter(&body)?,
                b'Z' => break,
                // EmptyQueryResponse, NoticeResponse, NotificationResponse
                _ => {}
            }
        }

        match server_error {
            Some(err) => Err(err),
            None => Ok(output),
        }
    }

    fn record_parameter(&mut self, body: &[u8]) -> Result<(), BackendError> {
        let (name, value) = wire::parse_parameter_status(body)?;
        if name == "server_version" {
            self.server_version = Some(value.to_string());
        }
        Ok(())
    }

    /// Next complete backend frame as `(tag, body)`.
    async fn next_frame(&mut self) -> Result<(u8, Bytes), BackendError> {
        loop {
            if let Some((tag, len)) = peek_backend(&self.buffer) {
                let frame = self.buffer.split_to(1 + len).freeze();
                return Ok((tag, frame.slice(5..)));
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(BackendError::Closed("server closed the connection"));
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), BackendError> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    fn track<T>(&mut self, outcome: Result<T, BackendError>) -> Result<T, BackendError> {
        if let Err(e) = &outcome {
            if e.is_fatal() {
                self.broken = true;
            }
        }
        outcome
    }
}

/// Bound a query future by `limit`; an elapsed timer counts as a fatal error.
pub(super) async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    timeout(limit, fut)
        .await
        .map_err(|_| BackendError::Timeout(limit))?
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
