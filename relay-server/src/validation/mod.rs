mod validator;

pub use validator::{HttpLinkValidator, LinkValidator};
