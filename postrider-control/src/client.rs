//! Control client used by the admin CLI.

use std::{path::PathBuf, time::Duration};

use postrider_common::attr::AttrList;
use tokio::{io::BufReader, net::UnixStream, time::timeout};

use crate::{
    ControlError,
    protocol::{Command, Request, Response},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct ControlClient {
    path: PathBuf,
}

impl ControlClient {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Execute one command and return the server's response.
    ///
    /// A rejected command surfaces as [`ControlError::Rejected`]; an
    /// unreachable or silent server as [`ControlError::Unavailable`].
    pub async fn execute(&self, command: Command) -> Result<Response, ControlError> {
        let exchange = async {
            let stream = UnixStream::connect(&self.path)
                .await
                .map_err(|e| ControlError::Unavailable(e.to_string()))?;
            let (read_half, mut write_half) = stream.into_split();
            Request::new(command)
                .to_attrs()
                .write_to(&mut write_half)
                .await
                .map_err(|e| ControlError::Protocol(e.to_string()))?;

            let mut reader = BufReader::new(read_half);
            let attrs = AttrList::read_from(&mut reader)
                .await
                .map_err(|e| ControlError::Protocol(e.to_string()))?
                .ok_or_else(|| {
                    ControlError::Unavailable("server closed the connection".to_string())
                })?;
            Response::from_attrs(&attrs)
        };
        let response = timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| ControlError::Unavailable("control request timed out".to_string()))??;
        match response.error {
            Some(message) => Err(ControlError::Rejected(message)),
            None => Ok(response),
        }
    }
}
