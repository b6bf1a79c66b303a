use std::path::PathBuf;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// OS segment used in patch server and tool download URLs.
pub fn os_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else {
        "linux"
    }
}

pub fn arch_name() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        "amd64"
    }
}

pub fn executable_name(stem: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{stem}.exe")
    } else {
        stem.to_string()
    }
}

/// Directory inside an instance that holds the client build.
pub const CLIENT_DIR: &str = "Client";

/// Location of the game client inside an instance directory.
pub fn client_executable_relative() -> PathBuf {
    if cfg!(target_os = "windows") {
        PathBuf::from(CLIENT_DIR).join("GameClient.exe")
    } else if cfg!(target_os = "macos") {
        PathBuf::from(CLIENT_DIR)
            .join("GameClient.app")
            .join("Contents")
            .join("MacOS")
            .join("GameClient")
    } else {
        PathBuf::from(CLIENT_DIR).join("GameClient")
    }
}

#[inline]
pub fn hide_console_window(command: &mut tokio::process::Command) {
    #[cfg(target_os = "windows")]
    {
        command.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(target_os = "windows"))]
    {
        let _ = command;
    }
}

pub fn trim_output_snippet(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .take(300)
        .collect::<String>()
        .trim()
        .to_string()
}
