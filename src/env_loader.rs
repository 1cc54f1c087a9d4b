use std::env;
use std::path::PathBuf;

fn fallback_dotenv_path(relay_home: Option<PathBuf>, home_dir: Option<PathBuf>) -> Option<PathBuf> {
    match (relay_home, home_dir) {
        (Some(relay_home), _) => Some(relay_home.join(".env")),
        (None, Some(home)) => Some(home.join(".report-relay").join(".env")),
        (None, None) => None,
    }
}

pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("RELAY_HOME").map(PathBuf::from),
        dirs::home_dir(),
    );

    let Some(path) = fallback else {
        return;
    };
    if path.is_file() {
        let _ = dotenvy::from_path(&path);
    }
}

#[cfg(test)]
mod tests {
    use super::fallback_dotenv_path;
    use std::path::PathBuf;

    #[test]
    fn fallback_prefers_relay_home() {
        let got = fallback_dotenv_path(
            Some(PathBuf::from("/srv/relay")),
            Some(PathBuf::from("/home/ops")),
        );

        assert_eq!(got, Some(PathBuf::from("/srv/relay/.env")));
    }

    #[test]
    fn fallback_uses_dot_dir_under_home_when_relay_home_unset() {
        let got = fallback_dotenv_path(None, Some(PathBuf::from("/home/ops")));
        assert_eq!(got, Some(PathBuf::from("/home/ops/.report-relay/.env")));
    }

    #[test]
    fn fallback_is_none_without_any_home() {
        assert_eq!(fallback_dotenv_path(None, None), None);
    }
}
