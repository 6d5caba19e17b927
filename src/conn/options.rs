use std::time::Duration;

use crate::compression::{Compressor, Decompressor};

/// Compression level used by permessage-deflate, from 0 (none) to 9 (best).
pub type CompressionLevel = flate2::Compression;

/// Default maximum message size accepted by a connection: 32 KiB.
pub const DEFAULT_READ_LIMIT: usize = 32 * 1024;

/// Default bound on the close handshake.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on concurrently outstanding pings.
pub const DEFAULT_MAX_OUTSTANDING_PINGS: usize = 16;

/// The role the WebSocket stream is taking.
///
/// When a server role is taken the frames will not be masked, unlike
/// the client role, in which frames are masked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Shorthand for the permessage-deflate setups most connections use.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompressionMode {
    /// No compression was negotiated.
    Disabled,
    /// Both directions start every message from a fresh context.
    NoContextTakeover,
    /// Both directions keep their context across messages.
    ContextTakeover,
}

/// Configuration options for a WebSocket connection.
///
/// `Options` carries the outcome of the upgrade handshake (compression parameters,
/// subprotocol) together with local policy such as the read limit and timeouts.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use wsengine::{CompressionMode, Options};
///
/// let options = Options::default()
///     .with_read_limit(1 << 20)
///     .with_compression_mode(CompressionMode::ContextTakeover)
///     .with_ping_timeout(Duration::from_secs(10))
///     .with_utf8();
/// ```
#[derive(Clone, Debug)]
pub struct Options {
    /// Maximum size of a single message, in bytes.
    ///
    /// A message exceeding it fails the read with
    /// [`WebSocketError::MessageTooBig`](crate::WebSocketError::MessageTooBig) and closes the
    /// connection with status 1009. For compressed messages the inflated size counts.
    ///
    /// Default: 32 KiB, as defined in [`DEFAULT_READ_LIMIT`].
    pub read_limit: usize,

    /// Negotiated permessage-deflate parameters, `None` when compression is disabled.
    pub compression: Option<DeflateOptions>,

    /// Flag to determine whether incoming text messages should be validated for UTF-8.
    ///
    /// Default: `false`
    pub check_utf8: bool,

    /// Reject frames whose payload length uses a longer encoding than necessary.
    ///
    /// RFC 6455 requires the minimal encoding but many peers are lenient about it.
    ///
    /// Default: `false`
    pub strict_length_encoding: bool,

    /// How long [`WebSocket::close`](crate::WebSocket::close) waits for the peer's close frame.
    ///
    /// Default: 5 seconds.
    pub close_timeout: Duration,

    /// How long [`WebSocket::ping`](crate::WebSocket::ping) waits for the pong, on top of any
    /// deadline the caller imposes.
    ///
    /// Default: `None`
    pub ping_timeout: Option<Duration>,

    /// How many pings may wait for their pong at the same time.
    ///
    /// Default: 16.
    pub max_outstanding_pings: usize,

    /// Subprotocol agreed during the upgrade.
    pub subprotocol: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            read_limit: DEFAULT_READ_LIMIT,
            compression: None,
            check_utf8: false,
            strict_length_encoding: false,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            ping_timeout: None,
            max_outstanding_pings: DEFAULT_MAX_OUTSTANDING_PINGS,
            subprotocol: None,
        }
    }
}

/// Negotiated permessage-deflate parameters.
///
/// # Context Management
///
/// - **Context Takeover** (default): compression state is kept between messages, improving
///   the ratio for similar messages at the cost of memory.
/// - **No Context Takeover**: every message starts from an empty window.
///
/// Each direction is configured independently: `server_no_context_takeover` governs what the
/// server sends, `client_no_context_takeover` what the client sends.
///
/// # Threshold
/// Messages smaller than the threshold are sent uncompressed. The threshold is a local policy
/// and not part of the negotiated extension.
#[derive(Clone, Debug, Default)]
pub struct DeflateOptions {
    /// Sets the compression level (0-9), balancing compression ratio against CPU usage.
    pub level: CompressionLevel,

    /// The server resets its compression context after each message.
    pub server_no_context_takeover: bool,

    /// The client resets its compression context after each message.
    pub client_no_context_takeover: bool,

    /// Minimum message size to compress. When `None`, 512 bytes for a sender without context
    /// takeover and 128 bytes for one with it.
    pub threshold: Option<usize>,
}

impl DeflateOptions {
    /// Whether the side with the given role discards its sending context between messages.
    pub(crate) fn no_context_takeover(&self, sender: Role) -> bool {
        match sender {
            Role::Server => self.server_no_context_takeover,
            Role::Client => self.client_no_context_takeover,
        }
    }

    /// The effective threshold for messages sent by `role`.
    pub fn threshold(&self, role: Role) -> usize {
        self.threshold.unwrap_or(if self.no_context_takeover(role) {
            512
        } else {
            128
        })
    }
}

impl Options {
    /// Builds the compressor for outgoing messages, if compression was negotiated.
    pub(crate) fn compressor(&self, role: Role) -> Option<Compressor> {
        let config = self.compression.as_ref()?;

        #[cfg(feature = "logging")]
        log::debug!(
            "Established compressor for {role} with settings \
            client_no_context_takeover={} server_no_context_takeover={} threshold={}",
            config.client_no_context_takeover,
            config.server_no_context_takeover,
            config.threshold(role),
        );

        Some(if config.no_context_takeover(role) {
            Compressor::no_context_takeover(config.level)
        } else {
            Compressor::new(config.level)
        })
    }

    /// Builds the decompressor for incoming messages, following the peer's sending context.
    pub(crate) fn decompressor(&self, role: Role) -> Option<Decompressor> {
        let config = self.compression.as_ref()?;

        let peer = match role {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        };

        #[cfg(feature = "logging")]
        log::debug!(
            "Established decompressor for {role} with settings \
            client_no_context_takeover={} server_no_context_takeover={}",
            config.client_no_context_takeover,
            config.server_no_context_takeover
        );

        Some(if config.no_context_takeover(peer) {
            Decompressor::no_context_takeover()
        } else {
            Decompressor::new()
        })
    }

    /// Returns the compression mode of the connection.
    ///
    /// Directions configured differently report `NoContextTakeover` when either side resets.
    pub fn compression_mode(&self) -> CompressionMode {
        match &self.compression {
            None => CompressionMode::Disabled,
            Some(config)
                if config.server_no_context_takeover || config.client_no_context_takeover =>
            {
                CompressionMode::NoContextTakeover
            }
            Some(_) => CompressionMode::ContextTakeover,
        }
    }

    /// Sets the maximum message size accepted.
    pub fn with_read_limit(self, read_limit: usize) -> Self {
        Self { read_limit, ..self }
    }

    /// Sets the negotiated permessage-deflate parameters.
    pub fn with_compression(self, compression: DeflateOptions) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Configures both directions at once.
    ///
    /// `Disabled` removes compression; the other modes keep any configured level and threshold.
    pub fn with_compression_mode(self, mode: CompressionMode) -> Self {
        let no_context = match mode {
            CompressionMode::Disabled => return self.without_compression(),
            CompressionMode::NoContextTakeover => true,
            CompressionMode::ContextTakeover => false,
        };

        let mut compression = self.compression.unwrap_or_default();
        compression.server_no_context_takeover = no_context;
        compression.client_no_context_takeover = no_context;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Sets the compression level for outgoing messages, enabling compression if needed.
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.level = level;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Sets the size below which messages are sent uncompressed, enabling compression if needed.
    pub fn with_compression_threshold(self, threshold: usize) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.threshold = Some(threshold);
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables compression for the WebSocket connection.
    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    /// Disables context takeover for what the server sends.
    pub fn server_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables context takeover for what the client sends.
    pub fn client_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Enables UTF-8 validation for incoming text messages.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Rejects payload lengths that are not minimally encoded.
    pub fn with_strict_length_encoding(self) -> Self {
        Self {
            strict_length_encoding: true,
            ..self
        }
    }

    /// Sets how long a close waits for the peer's close frame.
    pub fn with_close_timeout(self, close_timeout: Duration) -> Self {
        Self {
            close_timeout,
            ..self
        }
    }

    /// Bounds every pong wait.
    pub fn with_ping_timeout(self, ping_timeout: Duration) -> Self {
        Self {
            ping_timeout: Some(ping_timeout),
            ..self
        }
    }

    /// Sets how many pings may be outstanding at once.
    pub fn with_max_outstanding_pings(self, max_outstanding_pings: usize) -> Self {
        Self {
            max_outstanding_pings,
            ..self
        }
    }

    /// Records the subprotocol agreed during the upgrade.
    pub fn with_subprotocol(self, subprotocol: impl Into<String>) -> Self {
        Self {
            subprotocol: Some(subprotocol.into()),
            ..self
        }
    }
}
