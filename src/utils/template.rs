//! String template rendering utilities.

pub struct TemplateVars;

impl TemplateVars {
    pub const DOMAIN: &'static str = "domain";
    pub const SERVER_NAME: &'static str = "server_name";
    pub const DOCUMENT_ROOT: &'static str = "document_root";
    pub const LOGS_PATH: &'static str = "logs_path";
    pub const PHP_FPM_SOCKET: &'static str = "php_fpm_socket";
    pub const DB_ROOT_PASSWORD: &'static str = "db_root_password";
    pub const WEB_ROOT: &'static str = "web_root";
    pub const WEB_USER: &'static str = "web_user";
    pub const NGINX_AVAILABLE: &'static str = "nginx_available";
    pub const NGINX_ENABLED: &'static str = "nginx_enabled";
}

/// Replace every `{{key}}` placeholder with its value.
pub fn render(template: &str, variables: &[(&str, &str)]) -> String {
    let mut result = template.to_string();

    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);
        result = result.replace(&placeholder, value);
    }

    result
}

pub fn is_present(template: &str, key: &str) -> bool {
    let placeholder = format!("{{{{{}}}}}", key);
    template.contains(&placeholder)
}
