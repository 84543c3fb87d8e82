//! Decode command implementation.

use std::io::Read;
use std::path::Path;

use synclane_protocol::{ClientMessage, ServerMessage};

/// Runs the decode command.
pub fn run(path: &Path, server: bool) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = read_input(path)?;
    println!("{}", render(&bytes, server)?);
    Ok(())
}

fn read_input(path: &Path) -> std::io::Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut bytes = Vec::new();
        std::io::stdin().read_to_end(&mut bytes)?;
        Ok(bytes)
    } else {
        std::fs::read(path)
    }
}

/// Decodes a message and renders it as pretty JSON.
pub fn render(bytes: &[u8], server: bool) -> Result<String, Box<dyn std::error::Error>> {
    let pretty = if server {
        serde_json::to_string_pretty(&ServerMessage::decode(bytes)?)?
    } else {
        serde_json::to_string_pretty(&ClientMessage::decode(bytes)?)?
    };
    Ok(pretty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use synclane_protocol::{MutationId, MutationOutcome, Version};
    use synclane_value::Value;

    #[test]
    fn renders_server_messages() {
        let message = ServerMessage::MutationResponse {
            mutation_id: MutationId(7),
            outcome: MutationOutcome::Success {
                value: Value::Integer(3),
                commit_version: Version(4),
            },
        };
        let rendered = render(&message.encode().unwrap(), true).unwrap();
        assert!(rendered.contains("\"MutationResponse\""));
        assert!(rendered.contains("\"$integer\": \"3\""));
    }

    #[test]
    fn rejects_the_wrong_direction() {
        let message = ServerMessage::FatalError {
            message: "bye".into(),
        };
        assert!(render(&message.encode().unwrap(), false).is_err());
    }
}
