//! HTML pages shown to the browser during the login flow.
//!
//! Each page is a small template with `{{Name}}` placeholders. Built-in defaults can be
//! replaced by files of the same name in a template directory.

use super::assertion::SignedResponse;
use crate::error::{config_error, IdpResult};
use std::path::Path;
use tracing::info;

const LOGIN_FILE: &str = "login-form.html";
const BAD_REQUEST_FILE: &str = "bad-request.html";
const ERROR_FILE: &str = "error.html";

const DEFAULT_LOGIN: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Sign in</title>
</head>
<body>
    <form method="POST" action="{{URL}}">
        <p class="error">{{Error}}</p>
        <label>Email <input type="text" name="email" autofocus/></label>
        <label>Password <input type="password" name="password"/></label>
        <input type="hidden" name="SAMLRequest" value="{{SAMLRequest}}"/>
        <input type="hidden" name="RelayState" value="{{RelayState}}"/>
        <input type="submit" value="Log In"/>
    </form>
</body>
</html>
"#;

const DEFAULT_BAD_REQUEST: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Bad request</title></head>
<body>
    <h1>Bad request</h1>
    <p>{{Message}}</p>
</body>
</html>
"#;

const DEFAULT_ERROR: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Error</title></head>
<body>
    <h1>Something went wrong</h1>
    <p>{{Message}}</p>
</body>
</html>
"#;

/// Message shown on the error page; internal details never reach the browser.
pub const GENERIC_ERROR_MESSAGE: &str = "A server error has occurred. Please try again later.";

/// Values echoed into the login form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoginForm<'a> {
    pub action_url: &'a str,
    pub message: &'a str,
    pub saml_request: &'a str,
    pub relay_state: &'a str,
}

#[derive(Clone, Debug)]
pub struct Pages {
    login: String,
    bad_request: String,
    error: String,
}

impl Default for Pages {
    fn default() -> Self {
        Self {
            login: DEFAULT_LOGIN.to_string(),
            bad_request: DEFAULT_BAD_REQUEST.to_string(),
            error: DEFAULT_ERROR.to_string(),
        }
    }
}

impl Pages {
    /// Loads overrides from `dir`; files that are absent keep the built-in page.
    pub fn from_dir(dir: &Path) -> IdpResult<Self> {
        if !dir.is_dir() {
            return Err(config_error(format!(
                "template directory {} does not exist",
                dir.display()
            )));
        }
        let mut pages = Self::default();
        for (file, slot) in [
            (LOGIN_FILE, &mut pages.login),
            (BAD_REQUEST_FILE, &mut pages.bad_request),
            (ERROR_FILE, &mut pages.error),
        ] {
            let path = dir.join(file);
            if path.is_file() {
                *slot = std::fs::read_to_string(&path)
                    .map_err(|err| config_error(format!("reading {}: {err}", path.display())))?;
                info!(template = %path.display(), "loaded page template");
            }
        }
        Ok(pages)
    }

    pub fn load(dir: Option<&Path>) -> IdpResult<Self> {
        match dir {
            Some(dir) => Self::from_dir(dir),
            None => Ok(Self::default()),
        }
    }

    pub fn login(&self, form: &LoginForm<'_>) -> String {
        render(
            &self.login,
            &[
                ("URL", form.action_url),
                ("Error", form.message),
                ("SAMLRequest", form.saml_request),
                ("RelayState", form.relay_state),
            ],
        )
    }

    pub fn bad_request(&self, message: &str) -> String {
        render(&self.bad_request, &[("Message", message)])
    }

    pub fn error(&self) -> String {
        render(&self.error, &[("Message", GENERIC_ERROR_MESSAGE)])
    }
}

/// SAML POST binding: a self-submitting form carrying the signed response.
pub fn auto_submit_form(response: &SignedResponse) -> String {
    let relay_input = if response.relay_state.is_empty() {
        String::new()
    } else {
        format!(
            r#"<input type="hidden" name="RelayState" value="{}"/>"#,
            html_escape(&response.relay_state)
        )
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>SAML SSO</title>
</head>
<body onload="document.forms[0].submit()">
    <noscript>
        <p>JavaScript is disabled. Click the button below to continue.</p>
    </noscript>
    <form method="POST" action="{}">
        <input type="hidden" name="SAMLResponse" value="{}"/>
        {}
        <noscript>
            <input type="submit" value="Continue"/>
        </noscript>
    </form>
</body>
</html>"#,
        html_escape(&response.acs_url),
        html_escape(&response.saml_response),
        relay_input
    )
}

/// Substitutes `{{Key}}` placeholders with escaped values in a single pass, so a value
/// containing a placeholder is never expanded again.
fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        match values.iter().find(|(name, _)| *name == key) {
            Some((_, value)) => out.push_str(&html_escape(value)),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
