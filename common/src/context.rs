use kube::runtime::events::Reporter;

fn get_prog_name() -> Option<String> {
    std::env::current_exe()
        .ok()?
        .file_name()?
        .to_str()?
        .to_owned()
        .into()
}

/// Field manager and controller name used on every write
pub fn get_client_name() -> String {
    "valkey-operator".to_string()
}

pub fn get_reporter() -> Reporter {
    Reporter {
        controller: get_client_name(),
        instance: std::env::var("POD_NAME").ok().or_else(get_prog_name),
    }
}
