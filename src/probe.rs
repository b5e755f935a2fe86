use derive_more::Display;

/// The tracing target used for all machine-readable probe events.
pub const TARGET: &str = "bridge_probe";

/// The Kind of the Probe.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// When the Lifecycle of the Bridge changes, like starting or shutting down.
    #[display(fmt = "lifecycle")]
    Lifecycle,
    /// An oracle request log moving through its confirmation window.
    #[display(fmt = "confirmation")]
    Confirmation,
    /// A fulfillment transaction moving through build/sign/broadcast.
    #[display(fmt = "fulfillment")]
    Fulfillment,
}
