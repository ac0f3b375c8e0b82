//! Common error types for the topolab runtime layer.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`TopoError`].
pub type TopoResult<T> = Result<T, TopoError>;

/// Errors raised by drivers, network provisioning and shared helpers.
#[derive(Error, Diagnostic, Debug)]
pub enum TopoError {
    /// Container not found.
    #[error("Container not found: {id}")]
    #[diagnostic(code(topolab::container::not_found))]
    ContainerNotFound {
        /// The container name or ID that was not found.
        id: String,
    },

    /// Container exists but has no live task.
    #[error("No task found for container {id}")]
    #[diagnostic(code(topolab::container::no_task))]
    NoTask {
        /// The container name or ID.
        id: String,
    },

    /// Image not found in the local store.
    #[error("Image not found: {reference}")]
    #[diagnostic(
        code(topolab::image::not_found),
        help("Pull the image before creating the container")
    )]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// Invalid container name.
    #[error("Invalid container name: {id}")]
    #[diagnostic(
        code(topolab::container::invalid_name),
        help("Container names must be alphanumeric, separated by '.', '_' or '-', 1-76 characters")
    )]
    InvalidContainerName {
        /// The invalid name.
        id: String,
    },

    /// Malformed bind mount.
    #[error("invalid bind mount provided: {bind}")]
    #[diagnostic(
        code(topolab::config::invalid_bind),
        help("Bind mounts use the form 'source:destination[:option,option]'")
    )]
    InvalidBind {
        /// The bind string as provided.
        bind: String,
    },

    /// Invalid resource quantity format.
    #[error("Invalid resource quantity: {value}")]
    #[diagnostic(
        code(topolab::config::invalid_quantity),
        help("Use formats like '512MB', '1GiB', '2g' for memory and '1.5', '500m' for CPU")
    )]
    InvalidResourceQuantity {
        /// The invalid value.
        value: String,
    },

    /// Unparseable subnet.
    #[error("Invalid subnet: {value}")]
    #[diagnostic(code(topolab::config::invalid_subnet))]
    InvalidSubnet {
        /// The subnet as provided.
        value: String,
    },

    /// Unparseable MTU.
    #[error("Invalid MTU: {value}")]
    #[diagnostic(code(topolab::config::invalid_mtu))]
    InvalidMtu {
        /// The MTU as provided.
        value: String,
    },

    /// Unparseable MAC address.
    #[error("Invalid MAC address: {value}")]
    #[diagnostic(
        code(topolab::config::invalid_mac),
        help("MAC addresses use six colon-separated hex octets, e.g. 02:42:ac:11:00:02")
    )]
    InvalidMac {
        /// The MAC address as provided.
        value: String,
    },

    /// Unparseable IP address.
    #[error("Invalid IP address: {value}")]
    #[diagnostic(code(topolab::config::invalid_address))]
    InvalidAddress {
        /// The address as provided.
        value: String,
    },

    /// Command or entrypoint that cannot be tokenized.
    #[error("Invalid command line: {value}")]
    #[diagnostic(
        code(topolab::config::invalid_command),
        help("Check for unbalanced quotes")
    )]
    InvalidCommand {
        /// The command as provided.
        value: String,
    },

    /// Network mode the drivers cannot provide.
    #[error("network mode {mode:?} is not currently supported")]
    #[diagnostic(
        code(topolab::config::network_mode),
        help("Supported modes are bridge, host, none and container:<name>")
    )]
    UnsupportedNetworkMode {
        /// The mode as provided.
        mode: String,
    },

    /// Network plugin binary missing from every search directory.
    #[error("Network plugin {plugin} not found in {paths}")]
    #[diagnostic(
        code(topolab::network::plugin_not_found),
        help("Install the CNI reference plugins or point CNI_BIN at their directory")
    )]
    PluginNotFound {
        /// Plugin type.
        plugin: String,
        /// Searched directories, colon-separated.
        paths: String,
    },

    /// Network plugin reported an error.
    #[error("Network plugin {plugin} failed (code {code}): {message}")]
    #[diagnostic(code(topolab::network::plugin))]
    Plugin {
        /// Plugin type.
        plugin: String,
        /// Error code from the plugin result, 0 when none was reported.
        code: u32,
        /// Error message.
        message: String,
    },

    /// Attach succeeded but the assigned addresses could not be read back.
    #[error("Failed to extract management addresses for {id}: {message}")]
    #[diagnostic(code(topolab::network::ip_extraction))]
    IpExtraction {
        /// The container name or ID.
        id: String,
        /// What went wrong.
        message: String,
    },

    /// Container engine or transport error.
    #[error("{context}: {message}")]
    #[diagnostic(code(topolab::engine))]
    Engine {
        /// Container name or operation the error relates to.
        context: String,
        /// Engine error message.
        message: String,
    },

    /// The operation was cancelled by the caller.
    #[error("Operation aborted: {operation} was cancelled")]
    #[diagnostic(code(topolab::cancelled))]
    Cancelled {
        /// The operation that was aborted.
        operation: String,
    },

    /// The operation ran past its deadline.
    #[error("Operation aborted: {operation} exceeded its deadline")]
    #[diagnostic(code(topolab::deadline_exceeded))]
    DeadlineExceeded {
        /// The operation that was aborted.
        operation: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(topolab::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(topolab::serialization))]
    Serialization(String),

    /// Operation not supported by this driver.
    #[error("Operation not supported: {feature}")]
    #[diagnostic(code(topolab::unsupported))]
    Unsupported {
        /// The unsupported operation.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(topolab::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(topolab::internal),
        help("This is a bug, please report it at https://github.com/topolab/topolab/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl TopoError {
    /// Build an engine error with the container name as context.
    pub fn engine(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Engine {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Returns true if the caller asked the operation to stop.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::DeadlineExceeded { .. })
    }

    /// Returns true for not-found conditions.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ContainerNotFound { .. } | Self::NoTask { .. } | Self::ImageNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for TopoError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
