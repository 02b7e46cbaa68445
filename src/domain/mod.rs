//! Domain layer public interface.
//!
//! Broker abstractions shared by the client and the consumer, independent
//! of any concrete broker library. Other modules import these symbols via
//! this module, not by referencing individual files directly.

mod transport;

pub use transport::{
    //
    Acknowledger,
    Address,
    Connector,
    ConnectorPtr,
    ConsumeOptions,
    Delivery,
    Envelope,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportPtr,
    CONTENT_TYPE_JSON,
};
