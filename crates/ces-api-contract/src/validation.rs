// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Validation helpers for API contract types

use crate::error::ApiContractError;

/// Maximum accepted length of a client-supplied session identifier.
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Validate a client-supplied session identifier.
///
/// Session ids become directory names under the workspace root, so the
/// accepted alphabet is restricted to `[A-Za-z0-9._-]` and ids made up
/// entirely of dots are rejected.
pub fn validate_session_id(id: &str) -> Result<(), ApiContractError> {
    if id.is_empty() || id.len() > MAX_SESSION_ID_LEN {
        return Err(ApiContractError::InvalidSessionId(format!(
            "session id must be 1..={} characters, got {}",
            MAX_SESSION_ID_LEN,
            id.len()
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(ApiContractError::InvalidSessionId(format!(
            "session id contains characters outside [A-Za-z0-9._-]: {}",
            id
        )));
    }
    if id.chars().all(|c| c == '.') {
        return Err(ApiContractError::InvalidSessionId(id.to_string()));
    }
    Ok(())
}

/// Validate a filename used for upload or artifact download.
///
/// Filenames must resolve inside the session working directory: path
/// separators, parent references and NUL bytes are refused outright.
pub fn validate_filename(name: &str) -> Result<(), ApiContractError> {
    if name.is_empty() {
        return Err(ApiContractError::InvalidFilename(
            "filename cannot be empty".to_string(),
        ));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(ApiContractError::InvalidFilename(format!(
            "filename must not contain path separators: {}",
            name
        )));
    }
    if name == "." || name == ".." || name.contains("..") {
        return Err(ApiContractError::InvalidFilename(format!(
            "filename must not reference parent directories: {}",
            name
        )));
    }
    if name.contains('\0') {
        return Err(ApiContractError::InvalidFilename(
            "filename must not contain NUL".to_string(),
        ));
    }
    Ok(())
}
