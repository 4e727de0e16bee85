// Licensed under the Apache-2.0 license

use log::{debug, info};
use ota_config::UpdateConfig;
use ota_lib::fetch::{Connection, FetchError, ImageSource, StreamError};
use reqwest::blocking::{Client, Response};
use reqwest::{Certificate, StatusCode};
use std::error::Error as _;
use std::io::{ErrorKind, Read};

/// Fetches the image over HTTP(S) from the configured firmware URL.
pub struct HttpImageSource {
    client: Client,
    url: String,
}

impl HttpImageSource {
    pub fn new(config: &UpdateConfig) -> anyhow::Result<Self> {
        // Bounds each wait on the server, not the whole transfer.
        let mut builder = Client::builder()
            .connect_timeout(config.recv_timeout())
            .timeout(config.recv_timeout());
        if let Some(path) = &config.server_cert_pem {
            let pem = std::fs::read(path)?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(Certificate::from_pem(&pem)?);
            info!("Trusting server certificate from {}", path.display());
        }
        if config.skip_common_name_check {
            builder = builder.danger_accept_invalid_hostnames(true);
        }
        Ok(HttpImageSource {
            client: builder.build()?,
            url: config.firmware_url.clone(),
        })
    }
}

impl ImageSource for HttpImageSource {
    type Connection = HttpConnection;

    fn connect(&self) -> Result<HttpConnection, FetchError> {
        let response = self.client.get(&self.url).send().map_err(connect_error)?;
        if response.status() != StatusCode::OK {
            return Err(FetchError::UnexpectedStatus(response.status().as_u16()));
        }
        debug!("{} answered, length {:?}", self.url, response.content_length());
        Ok(HttpConnection {
            response,
            finished: false,
        })
    }

    fn location(&self) -> String {
        self.url.clone()
    }
}

fn connect_error(err: reqwest::Error) -> FetchError {
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    let lower = detail.to_lowercase();
    if lower.contains("certificate") || lower.contains("handshake") {
        FetchError::HandshakeFailed(detail)
    } else {
        FetchError::Unreachable(detail)
    }
}

fn stream_error(err: std::io::Error) -> StreamError {
    let inner = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>());
    match err.kind() {
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::UnexpectedEof => {
            StreamError::Reset
        }
        ErrorKind::TimedOut | ErrorKind::WouldBlock => StreamError::Timeout,
        _ if inner.is_some_and(|e| e.is_timeout()) => StreamError::Timeout,
        // hyper reports a body that ends before its Content-Length this way.
        _ if inner.is_some_and(|e| e.is_body() || e.is_decode()) => StreamError::Reset,
        _ => StreamError::Io(err.to_string()),
    }
}

pub struct HttpConnection {
    response: Response,
    finished: bool,
}

impl Connection for HttpConnection {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        match self.response.read(buf) {
            Ok(0) => {
                self.finished = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(stream_error(err)),
        }
    }

    fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    fn body_finished(&self) -> bool {
        self.finished
    }
}
