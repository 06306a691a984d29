pub mod certificate;
pub mod client;
pub mod common;
pub mod monitor;
pub mod pdb;
pub mod rbac;
pub mod restore;
pub mod secret;
pub mod security;
pub mod service;
pub mod statefulset;
pub mod topology;

pub use client::{KubeClient, KubeClientImpl};
pub use common::{
    ANNOTATION_IGNORE, ANNOTATION_INIT_SPEC, ANNOTATION_LAST_APPLIED, FIELD_MANAGER, KIND,
    LABEL_KIND, LABEL_NAME, Verb, selector_string, standard_labels,
};
