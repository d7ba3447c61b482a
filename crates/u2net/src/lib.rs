//! U2-Net lesion segmentation for retinal fundus images.
//!
//! This crate ties the network, loss, metrics and data pipeline together
//! into a training runner, mask inference and training-curve plots, and
//! ships the `u2net` command line tool.

pub mod backend;
pub mod history;
pub mod inference;
pub mod plot;
pub mod telemetry;
pub mod training;

#[doc(inline)]
pub use u2net_loss as loss;
#[doc(inline)]
pub use u2net_metric as metric;
#[doc(inline)]
pub use u2net_model as model;
#[doc(inline)]
pub use u2net_train as train;
