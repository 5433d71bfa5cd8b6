//! Google OAuth constants
//!
//! Public OAuth client configuration for the CloudCode installed
//! application. Installed-app client ids and "secrets" ship inside every
//! client binary and identify the application, not a user. The actual
//! secrets (access/refresh tokens) live in the credential store.

/// Public OAuth client id of the CloudCode installed application.
pub const CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";

/// Companion client secret. Installed-application secrets are not
/// confidential; this one ships in every client build.
pub const CLIENT_SECRET: &str = "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";

/// Google's token endpoint, used for the refresh grant.
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
