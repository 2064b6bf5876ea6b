//! [`OverviewProvider`] backed by one [`nntp_rs::NntpClient`] connection.
//!
//! Compression is negotiated with `XFEATURE COMPRESS GZIP` (or RFC 8054
//! `COMPRESS DEFLATE` when the server offers it). Neither can be switched off
//! on a live connection, so turning compression off reconnects.

use super::{GroupInfo, OverviewProvider, RawHeader, SessionFactory, overview};
use crate::config::{RetryConfig, ServerConfig};
use crate::error::NntpError;
use crate::retry::with_retry;
use nntp_rs::NntpClient;
use std::sync::Arc;
use tokio::time::error::Elapsed;

/// One persistent NNTP connection owned by one worker
pub struct NntpSession {
    server: ServerConfig,
    retry: RetryConfig,
    client: Option<NntpClient>,
    group: Option<String>,
    compression_unsupported: bool,
    xref_unsupported: bool,
}

impl NntpSession {
    /// Connect (with backoff) and authenticate
    pub async fn connect(server: ServerConfig, retry: RetryConfig) -> Result<Self, NntpError> {
        let mut session = Self {
            server,
            retry,
            client: None,
            group: None,
            compression_unsupported: false,
            xref_unsupported: false,
        };
        session.establish().await?;
        Ok(session)
    }

    async fn establish(&mut self) -> Result<(), NntpError> {
        let server = self.server.clone();
        let client = with_retry(&self.retry, || open_client(&server)).await?;
        self.client = Some(client);
        tracing::debug!(host = %self.server.host, "NNTP session established");
        Ok(())
    }

    async fn ensure_connected(&mut self) -> Result<(), NntpError> {
        if self.client.is_none() {
            self.establish().await?;
            if let Some(group) = self.group.clone() {
                self.group_command(&group).await?;
            }
        }
        Ok(())
    }

    fn client(&mut self) -> Result<&mut NntpClient, NntpError> {
        self.client
            .as_mut()
            .ok_or_else(|| NntpError::Transient("not connected".to_string()))
    }

    /// Unwrap a timed client call. A transient failure or a connection the
    /// client marked broken is dropped so the next call reconnects.
    fn settle<T>(
        &mut self,
        result: Result<nntp_rs::Result<T>, Elapsed>,
        command: &str,
    ) -> Result<T, NntpError> {
        let err = match result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => NntpError::from(e),
            Err(_) => NntpError::Transient(format!(
                "timed out after {}s waiting for response to {command}",
                self.server.timeout.as_secs()
            )),
        };
        if err.is_transient() || self.client.as_ref().is_some_and(NntpClient::is_broken) {
            self.client = None;
        }
        Err(err)
    }

    async fn group_command(&mut self, name: &str) -> Result<GroupInfo, NntpError> {
        let limit = self.server.timeout;
        let client = self.client()?;
        let result = tokio::time::timeout(limit, client.select_group(name)).await;
        let info = self.settle(result, "GROUP")?;
        self.group = Some(name.to_string());
        Ok(GroupInfo {
            name: name.to_string(),
            first: info.first,
            last: info.last,
            count: info.count,
        })
    }

    async fn set_compression(&mut self, wanted: bool) -> Result<(), NntpError> {
        let active = self
            .client
            .as_ref()
            .is_some_and(NntpClient::is_compression_enabled);
        if wanted && !active && !self.compression_unsupported {
            let limit = self.server.timeout;
            let client = self.client()?;
            let result = tokio::time::timeout(limit, client.try_enable_compression()).await;
            if !self.settle(result, "XFEATURE COMPRESS GZIP")? {
                tracing::info!(
                    host = %self.server.host,
                    "Server does not support compressed headers, using plain XOVER"
                );
                self.compression_unsupported = true;
            }
        } else if !wanted && active {
            self.reconnect().await?;
        }
        Ok(())
    }

    /// Xref is not part of the standard overview fields, so it is fetched
    /// separately. Servers without `HDR` leave every xref empty.
    async fn attach_xrefs(
        &mut self,
        range: &str,
        headers: &mut [RawHeader],
    ) -> Result<(), NntpError> {
        if headers.is_empty() || self.xref_unsupported {
            return Ok(());
        }
        let limit = self.server.timeout;
        let client = self.client()?;
        let result = tokio::time::timeout(limit, client.hdr("Xref", range)).await;
        let entries = match result {
            Ok(Err(nntp_rs::NntpError::InvalidArticleNumber))
            | Ok(Err(nntp_rs::NntpError::Protocol { code: 423, .. })) => return Ok(()),
            Ok(Err(nntp_rs::NntpError::Protocol {
                code: code @ (500 | 501 | 503),
                message,
            })) => {
                tracing::debug!(
                    host = %self.server.host,
                    code,
                    message = %message,
                    "Server does not support HDR Xref, cross-posts will not be recorded"
                );
                self.xref_unsupported = true;
                return Ok(());
            }
            other => self.settle(other, "HDR Xref")?,
        };
        overview::attach_xrefs(headers, entries);
        Ok(())
    }
}

#[async_trait::async_trait]
impl OverviewProvider for NntpSession {
    async fn select_group(&mut self, name: &str) -> Result<GroupInfo, NntpError> {
        if self.client.is_none() {
            self.establish().await?;
        }
        self.group_command(name).await
    }

    async fn fetch_overview(
        &mut self,
        first: u64,
        last: u64,
        compressed: bool,
    ) -> Result<Vec<RawHeader>, NntpError> {
        self.ensure_connected().await?;
        self.set_compression(compressed).await?;

        let range = if first == last {
            first.to_string()
        } else {
            format!("{first}-{last}")
        };
        let limit = self.server.timeout;
        let client = self.client()?;
        let result = tokio::time::timeout(limit, client.fetch_xover(&range)).await;
        let entries = match result {
            // No articles in that range / no such article number
            Ok(Err(nntp_rs::NntpError::Protocol {
                code: 420 | 423, ..
            })) => return Ok(Vec::new()),
            other => self.settle(other, "XOVER")?,
        };

        let mut headers: Vec<RawHeader> =
            entries.into_iter().filter_map(overview::from_xover).collect();
        self.attach_xrefs(&range, &mut headers).await?;
        Ok(headers)
    }

    async fn reconnect(&mut self) -> Result<(), NntpError> {
        if let Some(mut client) = self.client.take() {
            let _ = tokio::time::timeout(self.server.timeout, client.quit()).await;
        }
        self.establish().await?;
        if let Some(group) = self.group.clone() {
            self.group_command(&group).await?;
        }
        Ok(())
    }
}

/// Opens an [`NntpSession`] against the configured server for each worker
pub struct NntpSessionFactory {
    server: ServerConfig,
    retry: RetryConfig,
}

impl NntpSessionFactory {
    /// Create a factory for one server
    pub fn new(server: ServerConfig, retry: RetryConfig) -> Self {
        Self { server, retry }
    }
}

#[async_trait::async_trait]
impl SessionFactory for NntpSessionFactory {
    async fn open(&self) -> Result<Box<dyn OverviewProvider>, NntpError> {
        let session = NntpSession::connect(self.server.clone(), self.retry.clone()).await?;
        Ok(Box::new(session))
    }
}

async fn open_client(server: &ServerConfig) -> Result<NntpClient, NntpError> {
    let connect = async {
        let mut client = NntpClient::connect(Arc::new(server.clone().into())).await?;
        if server.username.is_some() {
            client.authenticate().await?;
        }
        Ok::<_, nntp_rs::NntpError>(client)
    };
    match tokio::time::timeout(server.timeout, connect).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(NntpError::Transient(format!(
            "timed out connecting to {}:{}",
            server.host, server.port
        ))),
    }
}
