/// Which kind of page the site is currently presenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// Phone/one-time-code login form.
    Login,
    /// Sign-up form the site sometimes shows instead of the login form.
    Registration,
    /// Any regular page.
    Content,
    /// Nothing recognisable was found.
    Unknown,
}

impl Surface {
    pub fn is_login_like(self) -> bool {
        matches!(self, Surface::Login | Surface::Registration)
    }
}

const LOGIN_URL_MARKERS: &[&str] = &["/login", "/signin", "mode=login"];
const CODE_FORM_MARKERS: &[&str] = &[
    "send otp",
    "get otp",
    "verify otp",
    "id=\"mobile\"",
    "name=\"mobile\"",
    "type=\"tel\"",
];
const REGISTRATION_MARKERS: &[&str] = &[
    "create account",
    "register now",
    "id=\"register",
    "name=\"full_name\"",
    "name=\"name\"",
    "sign up</",
];

/// Classifies a landing from its final URL and markup.
pub fn classify_surface(url: &str, body: &str) -> Surface {
    let url = url.to_ascii_lowercase();
    let body = body.to_ascii_lowercase();
    let has_code_form = CODE_FORM_MARKERS.iter().any(|m| body.contains(m));
    let has_registration = REGISTRATION_MARKERS.iter().any(|m| body.contains(m));

    if has_registration && !body.contains("otp") {
        return Surface::Registration;
    }
    if has_code_form || LOGIN_URL_MARKERS.iter().any(|m| url.contains(m)) {
        return Surface::Login;
    }
    if body.trim().is_empty() {
        Surface::Unknown
    } else {
        Surface::Content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_form_is_detected() {
        let body = r#"<div class="modal-overlay"><input id="mobile" type="tel" maxlength="10">
            <input type="submit" class="custom-button" value="Send OTP"></div>"#;
        assert_eq!(classify_surface("https://site.test/", body), Surface::Login);
    }

    #[test]
    fn redirect_to_login_url() {
        assert_eq!(
            classify_surface("https://site.test/login?next=/venuePage/1", "<html></html>"),
            Surface::Login
        );
    }

    #[test]
    fn registration_variant_is_detected() {
        let body = r#"<form id="register-form"><input name="name"><button>Sign Up</button></form>"#;
        assert_eq!(classify_surface("https://site.test/", body), Surface::Registration);
    }

    #[test]
    fn header_login_button_alone_is_content() {
        let body = concat!(
            r#"<span class="login-btn">Login / SignUp</span>"#,
            r#"<div class="court-item">1</div>"#
        );
        assert_eq!(classify_surface("https://site.test/venuePage/1", body), Surface::Content);
        assert_eq!(classify_surface("https://site.test/", "  "), Surface::Unknown);
    }
}
