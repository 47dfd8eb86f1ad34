use crate::RuntimeError;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Bounds connection setup only; image bodies may take arbitrarily long.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Plain HTTP(S) GET client used for image downloads and remote manifests.
pub struct HttpClient {
    agent: ureq::Agent,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_connect(Some(CONNECT_TIMEOUT))
            .build()
            .into();
        Self { agent }
    }

    fn open(&self, url: &str) -> Result<ureq::http::Response<ureq::Body>, RuntimeError> {
        let fail = |reason: String| RuntimeError::Download {
            url: url.to_owned(),
            reason,
        };
        let resp = match self.agent.get(url).call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(code)) => return Err(fail(format!("HTTP {code}"))),
            Err(e) => return Err(fail(e.to_string())),
        };
        let code = resp.status().as_u16();
        if code >= 400 {
            return Err(fail(format!("HTTP {code}")));
        }
        Ok(resp)
    }

    /// Stream `url` into `dest`, returning the number of bytes written.
    /// The caller owns cleanup of `dest` on error.
    pub fn download_to(&self, url: &str, dest: &Path) -> Result<u64, RuntimeError> {
        debug!("GET {url} -> {}", dest.display());
        let resp = self.open(url)?;
        let mut reader = resp.into_body().into_reader();
        let mut out = File::create(dest)?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).map_err(|e| RuntimeError::Download {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            total += n as u64;
        }
        out.sync_all()?;
        Ok(total)
    }

    pub fn get_text(&self, url: &str) -> Result<String, RuntimeError> {
        debug!("GET {url}");
        let resp = self.open(url)?;
        let mut reader = resp.into_body().into_reader();
        let mut body = String::new();
        reader
            .read_to_string(&mut body)
            .map_err(|e| RuntimeError::Download {
                url: url.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(body)
    }
}
