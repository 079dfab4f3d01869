//! Contains all of the types needed to specify options for operations and client construction.

pub use crate::{
    change_stream::ChangeStreamOptions,
    client::auth::{AuthMechanism, Credential},
    client::options::{
        Acknowledgment,
        ClientOptions,
        FindOptions,
        ServerAddress,
        Tls,
        TlsOptions,
        WriteConcern,
    },
    selection_criteria::{
        Predicate,
        ReadPreference,
        ReadPreferenceOptions,
        SelectionCriteria,
        TagSet,
    },
};
