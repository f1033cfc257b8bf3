use std::io::{self, BufRead, Write};

use rawvert_core::{DeletionPlan, Operator, PauseContext, PauseDecision};

const MB: f64 = 1024.0 * 1024.0;

/// Asks on the controlling terminal. End of input counts as "stop" for a
/// pause and "no" for a deletion.
pub struct TerminalOperator;

impl TerminalOperator {
    fn read_answer(&self, prompt: &str) -> Option<String> {
        print!("{prompt}");
        io::stdout().flush().ok()?;

        let mut input = String::new();
        match io::stdin().lock().read_line(&mut input) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(input.trim().to_lowercase()),
        }
    }
}

impl Operator for TerminalOperator {
    fn resolve_pause(&mut self, context: &PauseContext) -> PauseDecision {
        println!();
        println!("Conversion PAUSED due to predicted disk space shortage.");
        println!(
            "You need approximately {:.1}MB for the remaining {} files ({:.1}MB available).",
            context.estimated_need_bytes as f64 / MB,
            context.remaining_files,
            context.free_bytes as f64 / MB
        );
        println!("Options:");
        println!("1. Free up disk space and press Enter to continue");
        println!("2. Type 'force' to continue anyway (may fail)");
        println!("3. Type 'exit' to stop and save progress");

        loop {
            let Some(answer) = self.read_answer("> ") else {
                return PauseDecision::Stop;
            };
            match answer.as_str() {
                "" => {
                    println!("Re-checking disk space...");
                    return PauseDecision::Recheck;
                }
                "force" => {
                    println!("Continuing conversion despite space warning...");
                    return PauseDecision::Force;
                }
                "exit" | "stop" => {
                    println!("Saving progress and exiting...");
                    return PauseDecision::Stop;
                }
                _ => println!("Press Enter, or type 'force' or 'exit'."),
            }
        }
    }

    fn confirm_deletion(&mut self, plan: &DeletionPlan) -> bool {
        println!();
        println!("Raw files to be deleted:");
        for group in &plan.directories {
            println!();
            println!("Directory: {}", group.directory.display());
            for (index, file) in group.files.iter().enumerate() {
                println!("  {}. {}", index + 1, file);
            }
        }
        println!();
        println!(
            "Total files to delete: {} ({:.1}MB)",
            plan.candidates.len(),
            plan.total_bytes as f64 / MB
        );

        let confirmed = self
            .read_answer("Proceed with deletion? (yes/no): ")
            .is_some_and(|answer| answer == "yes");
        if !confirmed {
            println!("Deletion cancelled.");
        }
        confirmed
    }
}
