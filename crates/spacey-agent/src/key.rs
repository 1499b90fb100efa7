// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Endpoint keys partitioning the socket pool

use serde::Serialize;
use std::borrow::Borrow;
use std::fmt;

use crate::options::{ConnectOptions, TlsOptions};

/// Identity of a pool partition.
///
/// Requests whose options derive the same key may share sockets; requests
/// with different keys never do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EndpointKey(String);

impl EndpointKey {
    /// Derive the key for a set of connect options.
    ///
    /// The layout is `host:port:localAddress[:family][:socketPath]`, followed
    /// by the TLS discriminators when TLS options are present.
    pub fn derive(options: &ConnectOptions) -> Self {
        let mut name = String::from(options.host_or_default());
        name.push(':');
        if let Some(port) = options.port.filter(|port| *port != 0) {
            name.push_str(&port.to_string());
        }
        name.push(':');
        if let Some(local) = &options.local_address {
            name.push_str(local);
        }
        // The family segment only appears when it is meaningful
        if let Some(family @ (4 | 6)) = options.family {
            name.push(':');
            name.push_str(&family.to_string());
        }
        if let Some(path) = &options.socket_path {
            name.push(':');
            name.push_str(path);
        }
        if let Some(tls) = &options.tls {
            append_tls(&mut name, tls, options.host.as_deref());
        }
        Self(name)
    }

    /// The key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn append_tls(name: &mut String, tls: &TlsOptions, host: Option<&str>) {
    let servername = tls
        .servername
        .as_deref()
        .filter(|servername| Some(*servername) != host);
    let reject = tls.reject_unauthorized.map(|r| r.to_string());

    for part in [
        tls.ca.as_deref(),
        tls.cert.as_deref(),
        tls.ciphers.as_deref(),
        tls.key.as_deref(),
        reject.as_deref(),
        servername,
        tls.min_version.as_deref(),
        tls.max_version.as_deref(),
    ] {
        name.push(':');
        if let Some(part) = part {
            name.push_str(part);
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EndpointKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&ConnectOptions> for EndpointKey {
    fn from(options: &ConnectOptions) -> Self {
        Self::derive(options)
    }
}

impl Borrow<str> for EndpointKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}
