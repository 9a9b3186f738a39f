pub mod batch;
pub mod constants;
pub mod fitting;
pub mod gmix;
pub mod jacobian;
pub mod logging;
pub mod mcal_errors;
pub mod meds;
pub mod metacal;
pub mod observation;
pub mod output;
pub mod plotting;
pub mod priors;
pub mod progress_bar;
pub mod results;
pub mod rng;
pub mod selector;
pub mod shape;
pub mod synthetic;
