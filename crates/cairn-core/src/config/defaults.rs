//! Default configuration values

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "cairn.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "cairn.yaml";

/// Get list of config file names to search for, in order of preference
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".cairn.toml",
        ".cairn.yaml",
    ]
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Cairn Configuration

[cache]
max_size = "10G"
download = true
upload = true

[scheduler]
network = false

[tasks.hello]
command = "echo hello > $CAIRN_OUTPUT/hello.txt"
"#;
