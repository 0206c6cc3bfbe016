//! Workflow diagram generation.
//!
//! Builds PlantUML source from the step graph. `svg`/`png` formats post the
//! source to a Kroki server (`NOETL_KROKI_URL`, default https://kroki.io)
//! and write the rendered bytes.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;

use noetl_control_plane::playbook::{parse_playbook, NextClause, Playbook};

/// Render a playbook's workflow diagram.
pub async fn render(file: PathBuf, format: &str, output: Option<PathBuf>) -> Result<()> {
    let content = std::fs::read_to_string(&file).context("failed to read playbook")?;
    let playbook = parse_playbook(&content).map_err(|e| anyhow!(e.to_string()))?;
    let source = plantuml_source(&playbook);

    match format {
        "plantuml" => match output {
            Some(path) => {
                std::fs::write(&path, source)?;
                println!("wrote {}", path.display());
            }
            None => println!("{}", source),
        },
        "svg" | "png" => {
            let kroki = std::env::var("NOETL_KROKI_URL")
                .unwrap_or_else(|_| "https://kroki.io".to_string());
            let url = format!("{}/plantuml/{}", kroki.trim_end_matches('/'), format);

            let response = reqwest::Client::new()
                .post(&url)
                .header("Content-Type", "text/plain")
                .body(source)
                .send()
                .await
                .context("kroki request failed")?;
            if !response.status().is_success() {
                return Err(anyhow!("kroki returned {}", response.status()));
            }
            let bytes = response.bytes().await?;

            let path = output.unwrap_or_else(|| {
                file.with_extension(format.to_string())
            });
            std::fs::write(&path, &bytes)?;
            println!("wrote {}", path.display());
        }
        other => return Err(anyhow!("unknown diagram format: {}", other)),
    }

    Ok(())
}

/// PlantUML activity source for the step graph.
fn plantuml_source(playbook: &Playbook) -> String {
    let mut lines = vec![
        "@startuml".to_string(),
        format!("title {}", playbook.name),
    ];

    for step in &playbook.workflow {
        let label = match &step.desc {
            Some(desc) => format!("{}\\n{}", step.step, desc),
            None => step.step.clone(),
        };
        lines.push(format!("rectangle \"{}\" as {}", label, ident(&step.step)));
    }
    // the implicit terminal
    if playbook.get_step("end").is_none() {
        lines.push("rectangle \"end\" as end".to_string());
    }

    for step in &playbook.workflow {
        for clause in &step.next {
            match clause {
                NextClause::Target(target) => {
                    lines.push(format!(
                        "{} --> {}",
                        ident(&step.step),
                        ident(target.step())
                    ));
                }
                NextClause::Conditional { when, then, otherwise } => {
                    for target in then {
                        lines.push(format!(
                            "{} --> {} : {}",
                            ident(&step.step),
                            ident(target.step()),
                            escape(when)
                        ));
                    }
                    for target in otherwise {
                        lines.push(format!(
                            "{} --> {} : else",
                            ident(&step.step),
                            ident(target.step())
                        ));
                    }
                }
            }
        }
    }

    lines.push("@enduml".to_string());
    lines.join("\n")
}

fn ident(step: &str) -> String {
    step.replace(|c: char| !c.is_alphanumeric(), "_")
}

fn escape(condition: &str) -> String {
    condition.replace('\n', " ").replace('"', "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plantuml_source() {
        let yaml = r#"
name: demo
workflow:
  - step: start
    next: [work]
  - step: work
    desc: does things
    next:
      - when: "{{ ok }}"
        then: [end]
        else: [start]
"#;
        let playbook = parse_playbook(yaml).unwrap();
        let source = plantuml_source(&playbook);

        assert!(source.starts_with("@startuml"));
        assert!(source.ends_with("@enduml"));
        assert!(source.contains("start --> work"));
        assert!(source.contains("work --> end"));
        assert!(source.contains("else"));
        assert!(source.contains("does things"));
    }

    #[test]
    fn test_ident_sanitizes() {
        assert_eq!(ident("fetch-data"), "fetch_data");
    }
}
