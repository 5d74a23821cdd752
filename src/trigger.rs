// Copyright (C) 2025 FZI Forschungszentrum Informatik
// SPDX-License-Identifier: Apache-2.0
//! Victim triggers
//!
//! A [`Trigger`] makes the victim execute the code under attack and returns
//! whatever the victim's reply is. Triggers are selected by URI:
//!
//! * `http://` and `https://` URIs request the resource and return the body
//! * `ssh://user@host[:port]` URIs attempt to log in. The server signs the
//!   key exchange with its Ed25519 host key before authentication fails.
//!
//! SSH logins are performed by an external helper program. It is invoked with
//! the URI as last argument and prints the signature [`Transcript`] as JSON on
//! stdout.
//!
//! [`Transcript`]: crate::eddsa::Transcript

pub mod error;


use std::process;

use reqwest::Url;

pub use error::Error;

/// Helper command performing SSH logins
pub const DEFAULT_SSH_HELPER: &str = "pf-ssh-transcript";

/// Marker of an authentication failure in the helper's error output
///
/// The login is not expected to succeed, so this is not treated as an error.
pub const AUTH_FAILURE: &str = "unable to authenticate";

/// A way of triggering the victim
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Request a resource via HTTP
    Http { url: Url },
    /// Attempt an SSH login
    Ssh {
        uri: Url,
        /// Helper program followed by its leading arguments
        helper: Vec<String>,
    },
}

impl Trigger {
    /// Select a trigger for the given URI
    pub fn from_uri(uri: &str) -> Result<Self, Error> {
        let url: Url = uri.parse().map_err(Error::InvalidUri)?;
        match url.scheme() {
            "http" | "https" => Ok(Self::Http { url }),
            "ssh" => {
                if url.host_str().is_none_or(str::is_empty) {
                    return Err(Error::MissingHost);
                }
                Ok(Self::Ssh {
                    uri: url,
                    helper: vec![DEFAULT_SSH_HELPER.into()],
                })
            }
            scheme => Err(Error::Unsupported(scheme.into())),
        }
    }

    /// Use the given command line for SSH logins
    ///
    /// Has no effect on HTTP triggers.
    pub fn with_ssh_helper<S: Into<String>>(self, command: impl IntoIterator<Item = S>) -> Self {
        match self {
            Self::Ssh { uri, .. } => Self::Ssh {
                uri,
                helper: command.into_iter().map(Into::into).collect(),
            },
            http => http,
        }
    }

    /// Trigger the victim once and return its reply
    ///
    /// HTTP responses are fully drained, so the victim is done by the time
    /// this fn returns. Proxies are never used.
    pub fn execute(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Http { url } => {
                log::debug!("Requesting {url}");
                let client = reqwest::blocking::Client::builder().no_proxy().build()?;
                let response = client.get(url.clone()).send()?;
                let status = response.status();
                if !status.is_success() {
                    log::warn!("Victim replied with status {status}");
                }
                Ok(response.bytes()?.to_vec())
            }
            Self::Ssh { uri, helper } => {
                let (program, args) = helper.split_first().ok_or(Error::NoHelper)?;
                log::debug!("Running {program} for {uri}");
                let output = process::Command::new(program)
                    .args(args)
                    .arg(uri.as_str())
                    .stdin(process::Stdio::null())
                    .output()
                    .map_err(Error::Spawn)?;
                let stderr = String::from_utf8_lossy(&output.stderr);
                if output.status.success() || stderr.contains(AUTH_FAILURE) {
                    Ok(output.stdout)
                } else {
                    Err(Error::Helper(output.status, stderr.trim().into()))
                }
            }
        }
    }
}
