//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line
//! arguments, and a `Commands` enum that represents the available subcommands
//! and their options. The CLI is deliberately thin: every subcommand maps to
//! one operation on [`crate::service::RagweedService`], plus the upload
//! validation (size cap, mime whitelist, declared-vs-detected mismatch) that
//! belongs to the calling layer rather than the core.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Write a starter config.yaml into the config directory.
    Init,

    /// Upload a document into the chunk store.
    #[clap(name = "ingest")]
    Ingest {
        /// Path of the file to ingest.
        file: PathBuf,

        /// Declared mime type; detected from the extension when omitted.
        #[arg(name = "mime-type", short = 'm', long = "mime-type")]
        mime_type: Option<String>,

        /// Resource id to ingest under; a fresh UUID when omitted.
        #[arg(name = "id", short = 'i', long = "id")]
        resource_id: Option<String>,
    },

    /// Ask a question, optionally inside a conversation.
    #[clap(name = "ask", alias = "a")]
    Ask {
        /// The question to ask.
        question: String,

        /// Conversation id for a history-aware answer.
        #[arg(name = "conversation", short = 'c', long = "conversation")]
        conversation: Option<i32>,

        /// User id owning the conversation.
        #[arg(name = "user", short = 'u', long = "user")]
        user: Option<String>,
    },

    /// Create a conversation for a user.
    #[clap(name = "new-conversation")]
    NewConversation {
        /// The owning user id.
        user: String,

        /// Optional conversation title.
        #[arg(name = "title", short = 't', long = "title")]
        title: Option<String>,
    },

    /// List stored resources.
    Resources,

    /// Delete a resource and its chunks.
    #[clap(name = "delete-resource")]
    DeleteResource {
        /// Resource id to delete.
        id: String,
    },

    /// Show the attributes learned for a user.
    Attributes {
        /// The user id.
        user: String,
    },

    /// Set the attribute names to learn for a user.
    #[clap(name = "set-attributes")]
    SetAttributes {
        /// The user id.
        user: String,

        /// Attribute names, comma separated (e.g. `name,city`).
        names: String,
    },

    /// Run a full extraction pass for a user now.
    Extract {
        /// The user id.
        user: String,
    },
}
