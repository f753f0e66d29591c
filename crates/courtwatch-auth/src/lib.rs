//! Session persistence and the phone + one-time-code login flow.

use courtwatch_types::CourtwatchError;

pub mod code;
pub mod machine;
pub mod store;

pub use code::{ChatCodeSource, CodeSource, OneTimeCode, StaticCodeSource, StdinCodeSource};
pub use machine::{AuthFailure, AuthOutcome, AuthSettings, AuthState, Authenticator};
pub use store::SessionStore;

pub fn auth_error(message: impl Into<String>) -> CourtwatchError {
    CourtwatchError::Auth(message.into())
}
