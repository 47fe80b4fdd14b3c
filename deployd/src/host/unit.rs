//! Unit definition and env file rendering

use std::collections::BTreeMap;

use deployd_api::ServiceDefinition;

use crate::storage::layout::ServiceLayout;

/// Render the supervisor unit for a service
pub fn render_unit(layout: &ServiceLayout, namespace: &str, service: &ServiceDefinition) -> String {
    let description = if !service.description.is_empty() {
        service.description.as_str()
    } else if !service.name.is_empty() {
        service.name.as_str()
    } else {
        layout.service_name.as_str()
    };

    format!(
        "[Unit]
Description={description}
After=network.target

[Service]
Type=simple
EnvironmentFile=-{env_file}
Environment=DEPLOYD_SERVICE_NAMESPACE={namespace}
Environment=DEPLOYD_SERVICE={service}
ExecStart={exec}
Restart=always
RestartSec=3

[Install]
WantedBy=multi-user.target
",
        description = single_line(description),
        env_file = layout.env_link_file().display(),
        namespace = namespace,
        service = service.id,
        exec = layout.exec_path(&service.executable_path).display(),
    )
}

/// Render `KEY="value"` lines, keys upper-cased, sorted
pub fn render_env(env: &BTreeMap<String, String>) -> String {
    let mut lines: Vec<String> = env
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"", key.to_uppercase(), escape_value(value)))
        .collect();
    lines.sort();

    let mut out = String::new();
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}
