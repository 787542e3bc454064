//! Apache httpd as a fixture product
//!
//! Renders a minimal httpd config into the workspace: one listener, pid file
//! under `run/`, error and access logs, the document root aliased at `/`, one
//! `ProxyPass`/`ProxyPassReverse` pair per routing rule, and free-form extra
//! directives appended at the end.

use std::borrow::Cow;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::FixtureConfig;
use crate::error::{FixtureError, Result};
use crate::process;
use crate::routing::ProxyRules;
use crate::server::{InstanceContext, ServerProduct, TestServer};
use crate::template::{self, TemplateVars};

/// Port probing for httpd instances starts here and walks down
pub const HTTPD_PORT_SEED: u16 = 65531;

pub const HTTPD_CONFIG_FILE: &str = "httpd.conf";

/// Module files loaded unconditionally by the rendered config
pub const REQUIRED_MODULES: &[&str] = &[
    "mod_headers.so",
    "mod_proxy.so",
    "mod_proxy_http.so",
    "mod_proxy_connect.so",
    "mod_alias.so",
    "mod_dir.so",
    "mod_autoindex.so",
    "mod_mime.so",
];

const HTTPD_TEMPLATE: &str = r#"LoadModule headers_module $modules/mod_headers.so
LoadModule proxy_module $modules/mod_proxy.so
LoadModule proxy_http_module $modules/mod_proxy_http.so
LoadModule proxy_connect_module $modules/mod_proxy_connect.so
LoadModule alias_module $modules/mod_alias.so
LoadModule dir_module $modules/mod_dir.so
LoadModule autoindex_module $modules/mod_autoindex.so
<IfModule !mod_log_config.c>
    LoadModule log_config_module $modules/mod_log_config.so
</IfModule>
LoadModule mime_module $modules/mod_mime.so

StartServers 1
ServerLimit 8

TypesConfig /etc/mime.types

ServerRoot $server_root
Listen $listen_addr
PidFile $server_root/run/httpd.pid

ErrorLog $log_dir/error.log
LogFormat "%h %l %u %t \"%r\" %>s %b" common
CustomLog $log_dir/access.log common
LogLevel info

$proxy_rules

Alias / $document_root/

<Directory $server_root>
    Options +Indexes
</Directory>

$extra_cfg
"#;

/// Everything substituted into the httpd template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpdVars {
    pub modules: PathBuf,
    pub server_root: PathBuf,
    pub listen_addr: String,
    pub document_root: PathBuf,
    pub log_dir: PathBuf,
    /// Pre-expanded proxy directives
    pub proxy_rules: String,
    pub extra_cfg: String,
}

impl TemplateVars for HttpdVars {
    fn lookup(&self, name: &str) -> Option<Cow<'_, str>> {
        match name {
            "modules" => Some(self.modules.to_string_lossy()),
            "server_root" => Some(self.server_root.to_string_lossy()),
            "listen_addr" => Some(Cow::Borrowed(&self.listen_addr)),
            "document_root" => Some(self.document_root.to_string_lossy()),
            "log_dir" => Some(self.log_dir.to_string_lossy()),
            "proxy_rules" => Some(Cow::Borrowed(&self.proxy_rules)),
            "extra_cfg" => Some(Cow::Borrowed(&self.extra_cfg)),
            _ => None,
        }
    }
}

/// Render the httpd config; identical vars always give identical output
pub fn render_config(vars: &HttpdVars) -> Result<String> {
    Ok(template::render(HTTPD_TEMPLATE, vars)?)
}

/// One `ProxyPass`/`ProxyPassReverse` pair per rule, in rule order
pub fn proxy_directives(rules: &ProxyRules) -> String {
    rules
        .expand(|rule| {
            vec![
                format!("ProxyPass {} {}", rule.source, rule.destination),
                format!("ProxyPassReverse {} {}", rule.source, rule.destination),
            ]
        })
        .join("\n")
}

/// Per-instance httpd options
#[derive(Debug, Clone, Default)]
pub struct HttpdOptions {
    proxy_rules: Vec<(String, String)>,
    extra_cfg: String,
    document_root: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    hostname: Option<String>,
}

impl HttpdOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward requests under `source` to `destination`
    pub fn proxy_rule(mut self, source: impl Into<String>, destination: impl Into<String>) -> Self {
        self.proxy_rules.push((source.into(), destination.into()));
        self
    }

    /// Directives appended verbatim to the config
    pub fn extra_cfg(mut self, cfg: impl Into<String>) -> Self {
        self.extra_cfg = cfg.into();
        self
    }

    /// Served at `/` (default: the workspace)
    pub fn document_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.document_root = Some(dir.into());
        self
    }

    /// Where httpd writes error.log and access.log (default: `<workspace>/logs`)
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Externally reachable hostname for this instance
    pub fn hostname(mut self, host: impl Into<String>) -> Self {
        self.hostname = Some(host.into());
        self
    }
}

/// The httpd product plugged into [`TestServer`]
#[derive(Debug, Clone)]
pub struct HttpdServer {
    rules: ProxyRules,
    extra_cfg: String,
    document_root: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    hostname: Option<String>,
}

impl HttpdServer {
    /// Validate `options`; duplicate proxy sources are rejected
    pub fn new(options: HttpdOptions) -> Result<Self> {
        Ok(Self {
            rules: ProxyRules::from_pairs(options.proxy_rules)?,
            extra_cfg: options.extra_cfg,
            document_root: options.document_root,
            log_dir: options.log_dir,
            hostname: options.hostname,
        })
    }

    pub fn proxy_rules(&self) -> &ProxyRules {
        &self.rules
    }

    fn log_dir_for(&self, workspace: &Path) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| workspace.join("logs"))
    }

    /// Template variables for an instance in `ctx`
    pub fn vars(&self, ctx: &InstanceContext<'_>) -> HttpdVars {
        let server_root = ctx.workspace.path().to_path_buf();
        HttpdVars {
            modules: ctx.config.httpd_modules.clone(),
            document_root: self.document_root.clone().unwrap_or_else(|| server_root.clone()),
            log_dir: self.log_dir_for(&server_root),
            listen_addr: ctx.listen_addr(),
            proxy_rules: proxy_directives(&self.rules),
            extra_cfg: self.extra_cfg.clone(),
            server_root,
        }
    }
}

impl ServerProduct for HttpdServer {
    fn name(&self) -> &str {
        "httpd"
    }

    fn port_seed(&self) -> u16 {
        HTTPD_PORT_SEED
    }

    fn config_file_name(&self) -> &str {
        HTTPD_CONFIG_FILE
    }

    fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    fn check_dependencies(&self, config: &FixtureConfig) -> Result<()> {
        process::resolve_program(&config.httpd_executable)?;

        if !config.httpd_modules.is_dir() {
            return Err(FixtureError::MissingDependency {
                what: "httpd modules directory".to_string(),
                path: config.httpd_modules.clone(),
            });
        }
        for module in REQUIRED_MODULES {
            let path = config.httpd_modules.join(module);
            if !path.is_file() {
                return Err(FixtureError::MissingDependency {
                    what: format!("httpd module {}", module),
                    path,
                });
            }
        }
        Ok(())
    }

    fn prepare_workspace(&self, ctx: &InstanceContext<'_>) -> Result<()> {
        // run/ comes with the workspace; a custom log dir may not exist yet
        let log_dir = self.log_dir_for(ctx.workspace.path());
        fs::create_dir_all(&log_dir).map_err(|e| FixtureError::workspace(&log_dir, e))
    }

    fn render_config(&self, ctx: &InstanceContext<'_>) -> Result<String> {
        render_config(&self.vars(ctx))
    }

    fn command(&self, config_path: &Path, config: &FixtureConfig) -> Vec<OsString> {
        let mut argv = vec![
            config.httpd_executable.clone().into_os_string(),
            OsString::from("-f"),
            config_path.as_os_str().to_os_string(),
        ];
        argv.extend(config.httpd_extra_args.iter().map(OsString::from));
        argv
    }
}

/// Start an httpd instance and wait until it serves requests
pub async fn httpd_server(config: &FixtureConfig, options: HttpdOptions) -> Result<TestServer<HttpdServer>> {
    TestServer::start(HttpdServer::new(options)?, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Workspace;
    use uuid::Uuid;

    fn sample_vars() -> HttpdVars {
        HttpdVars {
            modules: PathBuf::from("/usr/lib/apache2/modules"),
            server_root: PathBuf::from("/tmp/ws"),
            listen_addr: "127.0.0.1:65531".to_string(),
            document_root: PathBuf::from("/tmp/ws"),
            log_dir: PathBuf::from("/tmp/ws/logs"),
            proxy_rules: "ProxyPass /api/ http://upstream:9000/\nProxyPassReverse /api/ http://upstream:9000/".to_string(),
            extra_cfg: "Header set X-Fixture yes".to_string(),
        }
    }

    #[test]
    fn test_render_is_deterministic() {
        let vars = sample_vars();
        let first = render_config(&vars).unwrap();
        let second = render_config(&vars.clone()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_render_contents() {
        let rendered = render_config(&sample_vars()).unwrap();
        assert!(rendered.contains("LoadModule proxy_module /usr/lib/apache2/modules/mod_proxy.so"));
        assert!(rendered.contains("Listen 127.0.0.1:65531"));
        assert!(rendered.contains("PidFile /tmp/ws/run/httpd.pid"));
        assert!(rendered.contains("ErrorLog /tmp/ws/logs/error.log"));
        assert!(rendered.contains("CustomLog /tmp/ws/logs/access.log common"));
        assert!(rendered.contains(r#"LogFormat "%h %l %u %t \"%r\" %>s %b" common"#));
        assert!(rendered.contains("Alias / /tmp/ws/"));
        assert!(rendered.contains("ProxyPass /api/ http://upstream:9000/\n"));
        assert!(rendered.trim_end().ends_with("Header set X-Fixture yes"));
        assert!(!rendered.contains('$'));
    }

    #[test]
    fn test_proxy_directives_two_lines_per_rule() {
        let rules = ProxyRules::from_pairs([
            ("/api/", "http://upstream:9000/"),
            ("/static/", "http://cdn:8080/assets/"),
            ("/ws/", "http://socket:7000/"),
        ])
        .unwrap();

        let block = proxy_directives(&rules);
        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(lines.len(), 2 * rules.len());
        assert_eq!(lines[0], "ProxyPass /api/ http://upstream:9000/");
        assert_eq!(lines[1], "ProxyPassReverse /api/ http://upstream:9000/");
        assert_eq!(lines[2], "ProxyPass /static/ http://cdn:8080/assets/");
        assert_eq!(lines[5], "ProxyPassReverse /ws/ http://socket:7000/");
    }

    #[test]
    fn test_no_rules_renders_empty_block() {
        assert_eq!(proxy_directives(&ProxyRules::new()), "");
    }

    #[test]
    fn test_duplicate_proxy_source_rejected() {
        let options = HttpdOptions::new()
            .proxy_rule("/api/", "http://a:1/")
            .proxy_rule("/api/", "http://b:2/");
        let err = HttpdServer::new(options).unwrap_err();
        assert!(matches!(err, FixtureError::DuplicateRoute { .. }));
    }

    #[test]
    fn test_vars_defaults_to_workspace() {
        let ws = Workspace::create(None, "httpd-test-").unwrap();
        let config = FixtureConfig::default();
        let server = HttpdServer::new(HttpdOptions::new().proxy_rule("/api/", "http://up:1/")).unwrap();
        let ctx = InstanceContext {
            id: Uuid::new_v4(),
            hostname: "127.0.0.1",
            port: 65000,
            workspace: &ws,
            config: &config,
        };

        let vars = server.vars(&ctx);
        assert_eq!(vars.server_root, ws.path());
        assert_eq!(vars.document_root, ws.path());
        assert_eq!(vars.log_dir, ws.path().join("logs"));
        assert_eq!(vars.listen_addr, "127.0.0.1:65000");
        assert_eq!(vars.proxy_rules.lines().count(), 2);
    }

    #[test]
    fn test_ipv6_listen_addr_is_bracketed() {
        let ws = Workspace::create(None, "httpd-test-").unwrap();
        let config = FixtureConfig::default();
        let server = HttpdServer::new(HttpdOptions::new()).unwrap();
        let ctx = InstanceContext {
            id: Uuid::new_v4(),
            hostname: "::1",
            port: 65000,
            workspace: &ws,
            config: &config,
        };

        let vars = server.vars(&ctx);
        assert_eq!(vars.listen_addr, "[::1]:65000");
        let rendered = server.render_config(&ctx).unwrap();
        assert!(rendered.contains("Listen [::1]:65000"));
    }

    #[test]
    fn test_custom_log_dir_is_created() {
        let ws = Workspace::create(None, "httpd-test-").unwrap();
        let config = FixtureConfig::default();
        let custom = ws.path().join("custom").join("logs");
        let server = HttpdServer::new(HttpdOptions::new().log_dir(&custom)).unwrap();
        let ctx = InstanceContext {
            id: Uuid::new_v4(),
            hostname: "127.0.0.1",
            port: 65000,
            workspace: &ws,
            config: &config,
        };

        server.prepare_workspace(&ctx).unwrap();
        assert!(custom.is_dir());
        assert_eq!(server.vars(&ctx).log_dir, custom);
    }

    #[test]
    fn test_command_line() {
        let mut config = FixtureConfig::default();
        config.httpd_executable = PathBuf::from("/usr/sbin/httpd");
        config.httpd_extra_args = vec!["-DFOREGROUND".to_string()];
        let server = HttpdServer::new(HttpdOptions::new()).unwrap();

        let argv = server.command(Path::new("/tmp/ws/httpd.conf"), &config);
        let argv: Vec<String> = argv.iter().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(argv, vec!["/usr/sbin/httpd", "-f", "/tmp/ws/httpd.conf", "-DFOREGROUND"]);
    }

    #[test]
    fn test_missing_executable_is_dependency_error() {
        let mut config = FixtureConfig::default();
        config.httpd_executable = PathBuf::from("/nonexistent/sbin/httpd");
        let server = HttpdServer::new(HttpdOptions::new()).unwrap();
        assert!(server.check_dependencies(&config).unwrap_err().is_dependency());
    }

    #[test]
    fn test_missing_module_is_dependency_error() {
        let modules = tempfile::tempdir().unwrap();
        for module in &REQUIRED_MODULES[..REQUIRED_MODULES.len() - 1] {
            fs::write(modules.path().join(module), b"").unwrap();
        }
        let mut config = FixtureConfig::default();
        config.httpd_executable = PathBuf::from("sh");
        config.httpd_modules = modules.path().to_path_buf();
        let server = HttpdServer::new(HttpdOptions::new()).unwrap();

        match server.check_dependencies(&config).unwrap_err() {
            FixtureError::MissingDependency { path, .. } => assert!(path.ends_with("mod_mime.so")),
            other => panic!("unexpected error: {:?}", other),
        }

        fs::write(modules.path().join("mod_mime.so"), b"").unwrap();
        server.check_dependencies(&config).unwrap();
    }
}
