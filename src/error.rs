// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the dispatcher and its collaborators.

use thiserror::Error;

use crate::executor::ExecutorError;

/// A single AWS-style error code, kept matchable instead of collapsed into
/// a string so the ASG loop can treat specific causes (e.g. a vanished
/// instance) as benign.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("ValidationError: {0}")]
    Validation(String),

    #[error("InvalidParameterValue: {0}")]
    InvalidParameterValue(String),

    #[error("InvalidAction: {0}")]
    InvalidAction(String),

    #[error("AlreadyExists: {0}")]
    AlreadyExists(String),

    #[error("ResourceInUse: {0}")]
    ResourceInUse(String),

    #[error("InvalidInstanceID.NotFound: {0}")]
    InstanceNotFound(String),

    #[error("InvalidVolumeID.NotFound: {0}")]
    VolumeNotFound(String),

    #[error("InvalidLaunchTemplateId.NotFound: {0}")]
    LaunchTemplateNotFound(String),

    #[error("ResourceNotFound: {0}")]
    AsgNotFound(String),

    #[error("DryRunOperation")]
    DryRun,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("InternalError: {0}")]
    Internal(String),
}

impl Error {
    /// The wire-facing AWS error code for this variant. The front-end that
    /// serializes the XML error envelope (out of scope here) reads this.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::InvalidParameterValue(_) => "InvalidParameterValue",
            Error::InvalidAction(_) => "InvalidAction",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::ResourceInUse(_) => "ResourceInUse",
            Error::InstanceNotFound(_) => "InvalidInstanceID.NotFound",
            Error::VolumeNotFound(_) => "InvalidVolumeID.NotFound",
            Error::LaunchTemplateNotFound(_) => "InvalidLaunchTemplateId.NotFound",
            Error::AsgNotFound(_) => "ResourceNotFound",
            Error::DryRun => "DryRunOperation",
            Error::Transport(_) => "InternalError",
            Error::Internal(_) => "InternalError",
        }
    }

    /// True for executor failures the ASG loop treats as "already gone"
    /// rather than escalating.
    pub fn is_instance_not_found(&self) -> bool {
        matches!(self, Error::InstanceNotFound(_))
    }
}

impl From<ExecutorError> for Error {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::InstanceNotFound(id) => Error::InstanceNotFound(id),
            ExecutorError::VolumeNotFound(id) => Error::VolumeNotFound(id),
            other => Error::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
