use anyhow::Result;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use super::build_service;

pub async fn run(config_path: &str, model: &str) -> Result<()> {
    let service = build_service(config_path).await?;
    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline(">>> ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/clear" {
                    match service.clear_history().await {
                        Ok(()) => println!("History cleared"),
                        Err(e) => eprintln!("Error: {}", e),
                    }
                    continue;
                }
                let _ = rl.add_history_entry(line);
                match service.query(model, line).await {
                    Ok(reply) => println!("{}", reply),
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => break,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}
