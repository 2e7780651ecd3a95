use std::env;
use std::path::PathBuf;

fn fallback_dotenv_path(snapsplit_home: Option<PathBuf>, config_dir: Option<PathBuf>) -> Option<PathBuf> {
    match snapsplit_home {
        Some(home) => Some(home.join(".env")),
        None => Some(config_dir?.join("snapsplit").join(".env")),
    }
}

/// `.env` in the working directory wins; otherwise `$SNAPSPLIT_HOME/.env`,
/// then `<config dir>/snapsplit/.env`.
pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("SNAPSPLIT_HOME").map(PathBuf::from),
        dirs::config_dir(),
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
    fn fallback_prefers_snapsplit_home() {
        let got = fallback_dotenv_path(
            Some(PathBuf::from("/workspace")),
            Some(PathBuf::from("/home/alice/.config")),
        );
        assert_eq!(got, Some(PathBuf::from("/workspace/.env")));
    }

    #[test]
    fn fallback_uses_config_dir_when_home_unset() {
        let got = fallback_dotenv_path(None, Some(PathBuf::from("/home/alice/.config")));
        assert_eq!(got, Some(PathBuf::from("/home/alice/.config/snapsplit/.env")));
    }

    #[test]
    fn no_fallback_without_any_base() {
        assert_eq!(fallback_dotenv_path(None, None), None);
    }
}
