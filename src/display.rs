use anyhow::Result;
use std::io::Write;

use crate::pipeline::Predictions;

/// Where finished predictions and surfaced errors end up. Lives on the interactive thread.
pub trait DisplaySink {
    fn show(&mut self, title: &str, predictions: &Predictions) -> Result<()>;
    fn show_error(&mut self, title: &str, message: &str) -> Result<()>;
    fn show_text(&mut self, text: &str) -> Result<()>;
}

/// Renders predictions as a markdown document, one section per model.
pub struct TerminalDisplay<W: Write> {
    out: W,
}

impl TerminalDisplay<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> TerminalDisplay<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

pub fn render_markdown(title: &str, predictions: &Predictions) -> String {
    let mut doc = format!("# {}\n\n_Input: {}_\n", title, predictions.input.describe());
    for (model, output) in &predictions.outputs {
        doc.push_str(&format!("\n## {}\n\n{}\n", model, output.to_string().trim_end()));
    }
    doc
}

impl<W: Write> DisplaySink for TerminalDisplay<W> {
    fn show(&mut self, title: &str, predictions: &Predictions) -> Result<()> {
        writeln!(self.out, "{}", render_markdown(title, predictions))?;
        self.out.flush()?;
        Ok(())
    }

    fn show_error(&mut self, title: &str, message: &str) -> Result<()> {
        writeln!(self.out, "> **{}**: {}\n", title, message)?;
        self.out.flush()?;
        Ok(())
    }

    fn show_text(&mut self, text: &str) -> Result<()> {
        writeln!(self.out, "{}", text)?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CapturedInput;
    use crate::pipeline::ModelOutput;

    fn predictions() -> Predictions {
        Predictions {
            action_name: "latex".to_string(),
            input: CapturedInput::Text("x squared".to_string()),
            outputs: vec![
                ("gpt-4o".to_string(), ModelOutput::Text("$x^2$\n".to_string())),
                ("llama3".to_string(), ModelOutput::Failed("timeout".to_string())),
            ],
        }
    }

    #[test]
    fn test_render_markdown_sections() {
        let doc = render_markdown("latex", &predictions());
        assert!(doc.starts_with("# latex\n"));
        assert!(doc.contains("_Input: text (9 chars)_"));
        assert!(doc.contains("## gpt-4o\n\n$x^2$\n"));
        assert!(doc.contains("## llama3\n\nError: timeout\n"));
        assert!(doc.find("gpt-4o").unwrap() < doc.find("llama3").unwrap());
    }

    #[test]
    fn test_terminal_display_writes() {
        let mut display = TerminalDisplay::new(Vec::new());
        display.show("latex", &predictions()).unwrap();
        display.show_error("Capture failed", "clipboard is empty").unwrap();
        let written = String::from_utf8(display.into_inner()).unwrap();
        assert!(written.contains("## gpt-4o"));
        assert!(written.contains("> **Capture failed**: clipboard is empty"));
    }
}
