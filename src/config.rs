/*
 * This file is a part of resp-client.
 *
 * resp-client is free software: you can redistribute it and/or modify
 * it under the terms of the Apache License, Version 2.0.
*/

//! # Connection configuration
//!
//! [`ConnectOptions`] covers every key in the external-interfaces options
//! table: endpoint selection, timeouts, and the auto-free/push knobs. It is
//! `serde`-derived, in the same way the store's own configuration surface
//! is, so embedders can load it from a config file as easily as build it
//! with the fluent setters below.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which transport endpoint to connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Tcp {
        ip: String,
        port: u16,
        source_addr: Option<String>,
    },
    Unix {
        path: String,
    },
    /// Adopt an already-open descriptor; the integer is the raw fd/handle.
    Fd(i32),
}

/// Address-family preference applied when resolving a TCP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AddressFamilyPreference {
    #[default]
    Unspecified,
    PreferIpv4,
    PreferIpv6,
    Ipv6ThenIpv4,
}

/// All options recognized by `connect` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub endpoint: Endpoint,
    pub connect_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
    pub nonblocking: bool,
    pub reuseaddr: bool,
    pub keepalive: bool,
    pub noautofree: bool,
    pub noautofreereplies: bool,
    pub nopushautofree: bool,
    pub address_family: AddressFamilyPreference,
}

impl ConnectOptions {
    /// Start building options for a TCP endpoint.
    pub fn tcp(ip: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::Tcp {
                ip: ip.into(),
                port,
                source_addr: None,
            },
            connect_timeout: None,
            command_timeout: None,
            nonblocking: false,
            reuseaddr: false,
            keepalive: true,
            noautofree: false,
            noautofreereplies: false,
            nopushautofree: false,
            address_family: AddressFamilyPreference::Unspecified,
        }
    }

    /// Start building options for a Unix domain socket endpoint.
    #[cfg(unix)]
    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::Unix { path: path.into() },
            connect_timeout: None,
            command_timeout: None,
            nonblocking: false,
            reuseaddr: false,
            keepalive: false,
            noautofree: false,
            noautofreereplies: false,
            nopushautofree: false,
            address_family: AddressFamilyPreference::Unspecified,
        }
    }

    pub fn with_source_addr(mut self, addr: impl Into<String>) -> Self {
        if let Endpoint::Tcp { source_addr, .. } = &mut self.endpoint {
            *source_addr = Some(addr.into());
        }
        self
    }

    pub fn with_connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = Some(d);
        self
    }

    pub fn with_command_timeout(mut self, d: Duration) -> Self {
        self.command_timeout = Some(d);
        self
    }

    pub fn nonblock(mut self, v: bool) -> Self {
        self.nonblocking = v;
        self
    }

    pub fn reuseaddr(mut self, v: bool) -> Self {
        self.reuseaddr = v;
        self
    }

    pub fn keepalive(mut self, v: bool) -> Self {
        self.keepalive = v;
        self
    }

    pub fn noautofree(mut self, v: bool) -> Self {
        self.noautofree = v;
        self
    }

    pub fn noautofreereplies(mut self, v: bool) -> Self {
        self.noautofreereplies = v;
        self
    }

    pub fn nopushautofree(mut self, v: bool) -> Self {
        self.nopushautofree = v;
        self
    }

    pub fn address_family(mut self, pref: AddressFamilyPreference) -> Self {
        self.address_family = pref;
        self
    }
}
