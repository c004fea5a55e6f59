pub fn welcome_message(name: &str) -> String {
    let rule = "=".repeat(name.len() + 8);
    format!(
        "{rule}\n    {name}\n{rule}\nengine {} | type 'help' for commands",
        crate::storage::handle::engine_version()
    )
}
