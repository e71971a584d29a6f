//! CLI argument parsing with clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Spell rotation automation.
///
/// Watches the screen through a detector, picks the highest-priority ready
/// spell for the current mode and presses its key. Run it in the foreground
/// with `spellcast run`, or let a background daemon host it and steer it
/// with the other commands.
#[derive(Debug, Parser)]
#[command(name = "spellcast", version)]
pub struct Cli {
    /// Settings file [default: ./spellcast.toml, then the user config dir]
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the engine in the foreground, reading commands from stdin
    #[command(after_help = "\
While running, type a line and press Enter:
  f1                                    # Any other text is a hotkey
  execute | skip                        # Answer a pending debug step
  reload [path]                         # Reload the strategy

Examples:
  spellcast run                         # Cast with ./spellcast.toml
  spellcast run --debug                 # Confirm every cast
  spellcast --config raid.toml run      # Use another settings file")]
    Run(RunArgs),

    /// Start the daemon process (usually auto-started)
    Daemon,

    /// Start the engine in the daemon
    #[command(after_help = "\
Examples:
  spellcast start                       # Start casting (mode starts STOPPED)
  spellcast start --debug               # Pause before each cast
  spellcast press f1                    # Switch to AOE mode")]
    Start(RunArgs),

    /// Stop the engine; the daemon keeps running
    Stop,

    /// Show engine state as JSON
    Status,

    /// Reload the strategy document
    #[command(after_help = "\
Examples:
  spellcast reload                      # Re-read the current strategy file
  spellcast reload strategies/fire.yaml # Switch to another strategy")]
    Reload(ReloadArgs),

    /// Send a hotkey to the mode listener
    #[command(after_help = "\
Keys are matched case-insensitively against [mode_switch_keys].

Examples:
  spellcast press f1                    # AOE mode (with aoe_mode = \"f1\")
  spellcast press F3                    # Stop casting")]
    Press(PressArgs),

    /// Answer a pending debug step
    #[command(after_help = "\
Examples:
  spellcast step execute                # Cast the announced spell
  spellcast step skip                   # Skip it and look again")]
    Step(StepArgs),

    /// Stream engine log lines and telemetry until the engine stops
    Watch,

    /// Stop the engine and the daemon
    Shutdown,

    /// Show an end-to-end usage example
    Examples,
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Wait for 'execute' or 'skip' before every cast
    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, clap::Args)]
pub struct ReloadArgs {
    /// Strategy file (YAML, JSON or TOML); omit to re-read the current one
    pub path: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
pub struct PressArgs {
    /// Key name, e.g. f1
    pub key: String,
}

#[derive(Debug, clap::Args)]
pub struct StepArgs {
    /// execute or skip
    pub decision: String,
}

pub const EXAMPLES_TEXT: &str = "\
spellcast: end-to-end example

1. Describe the rotation (strategies/frost.yaml):

   name: Frost
   global_cooldown: 1.5
   bindings:
     nuke: \"1\"
   aoe_priority:
     - {name: blizzard, key: \"2\"}
     - {name: frostbolt, key: nuke}
   single_target_priority:
     - {name: frostbolt, key: nuke}

2. Point the settings at it (spellcast.toml):

   current_strategy = \"strategies/frost.yaml\"

   [mode_switch_keys]
   aoe_mode = \"f1\"
   single_target_mode = \"f2\"
   stop_casting = \"f3\"

   [perception]
   kind = \"command\"
   command = [\"python3\", \"detect.py\"]

   The detector prints a JSON array such as
   [{\"label\": \"frostbolt_ready\", \"confidence\": 0.93, \"box\": [10, 10, 42, 42]}]

3. Start and steer the engine:

   spellcast start --debug
   spellcast watch &
   spellcast press f2
   spellcast step execute
   spellcast stop

Without [effector] settings keys are only logged (dry run). Use
kind = \"command\" with press/release templates to send real keystrokes.
";
