//! Client for the control-plane API of remote sluice nodes
//!
//! A [`RemoteExecutionClient`] drives pipelines and jobs hosted by another
//! node: submit, prepare, start, pause, resume, stop, status, logs and
//! removal, plus the cluster helpers (port allocation, sequences, peers).
//!
//! Node descriptors may carry `${NAME}` tokens in any field. They are
//! resolved against [`Variables`] every time a call is made.
//!
//! ```no_run
//! use sluice_client::prelude::*;
//!
//! # async fn run(configuration: PipelineConfiguration) -> Result<(), ClientError> {
//! let node = SlaveNode::new("slave-1", "${SLAVE_HOST}", "8081").with_credentials("cluster", "cluster");
//! let client = RemoteExecutionClient::new(node).with_variables(Variables::from_env());
//!
//! let run_id = client.run_pipeline(&configuration).await?;
//! let status = client
//!     .wait_for(ExecutionKind::Pipeline, &run_id, std::time::Duration::from_secs(1))
//!     .await?;
//! println!("{}: {}", run_id, status.state);
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod descriptor;
mod error;
mod variables;

pub use client::RemoteExecutionClient;
pub use config::ClientConfig;
pub use descriptor::{has_unresolved_variables, ResolvedNode, SlaveNode};
pub use error::ClientError;
pub use variables::Variables;

/// Prelude to import all relevant types
pub mod prelude {
    pub use super::{
        ClientConfig, ClientError, RemoteExecutionClient, ResolvedNode, SlaveNode, Variables,
    };

    pub use sluice_protocol::prelude::*;
}
