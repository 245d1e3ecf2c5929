//! Fitting taxonomy
//!
//! A fitting names the shape of a traffic stream at a point in the
//! pipeline. Connectors consume one fitting and produce another; the
//! foundry chains them by matching output to input.

use crate::error::{Error, Result};
use crate::tuple::ports;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Traffic shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Fitting {
    /// Raw octets; every session is at least this
    OctetStream,
    /// HTTP framed stream
    HttpStream,
    /// HTTP token stream (parsed by the HTTP casing)
    HttpTokens,
    /// HTTPS stream
    HttpsStream,
    /// FTP control channel
    FtpCtlStream,
    /// FTP control tokens
    FtpCtlTokens,
    /// FTP data channel
    FtpDataStream,
    /// FTP data tokens
    FtpDataTokens,
    /// SMTP stream
    SmtpStream,
    /// SMTP tokens
    SmtpTokens,
    /// POP3 stream
    PopStream,
    /// POP3 tokens
    PopTokens,
    /// IMAP stream
    ImapStream,
    /// IMAP tokens
    ImapTokens,
}

impl Fitting {
    /// All fittings, in declaration order
    pub const ALL: [Fitting; 14] = [
        Fitting::OctetStream,
        Fitting::HttpStream,
        Fitting::HttpTokens,
        Fitting::HttpsStream,
        Fitting::FtpCtlStream,
        Fitting::FtpCtlTokens,
        Fitting::FtpDataStream,
        Fitting::FtpDataTokens,
        Fitting::SmtpStream,
        Fitting::SmtpTokens,
        Fitting::PopStream,
        Fitting::PopTokens,
        Fitting::ImapStream,
        Fitting::ImapTokens,
    ];

    /// Canonical name
    pub fn as_str(self) -> &'static str {
        match self {
            Fitting::OctetStream => "OCTET_STREAM",
            Fitting::HttpStream => "HTTP_STREAM",
            Fitting::HttpTokens => "HTTP_TOKENS",
            Fitting::HttpsStream => "HTTPS_STREAM",
            Fitting::FtpCtlStream => "FTP_CTL_STREAM",
            Fitting::FtpCtlTokens => "FTP_CTL_TOKENS",
            Fitting::FtpDataStream => "FTP_DATA_STREAM",
            Fitting::FtpDataTokens => "FTP_DATA_TOKENS",
            Fitting::SmtpStream => "SMTP_STREAM",
            Fitting::SmtpTokens => "SMTP_TOKENS",
            Fitting::PopStream => "POP_STREAM",
            Fitting::PopTokens => "POP_TOKENS",
            Fitting::ImapStream => "IMAP_STREAM",
            Fitting::ImapTokens => "IMAP_TOKENS",
        }
    }

    /// Fitting implied by a well-known TCP server port
    pub fn for_tcp_port(port: u16) -> Option<Fitting> {
        match port {
            ports::FTP => Some(Fitting::FtpCtlStream),
            ports::SMTP => Some(Fitting::SmtpStream),
            ports::HTTP => Some(Fitting::HttpStream),
            ports::HTTPS => Some(Fitting::HttpsStream),
            _ => None,
        }
    }
}

impl fmt::Display for Fitting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Fitting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        Fitting::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == wanted)
            .ok_or_else(|| Error::UnknownFitting(s.to_string()))
    }
}
