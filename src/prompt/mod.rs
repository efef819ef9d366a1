//! Message builder.
//!
//! Turns a task input into the system and user messages sent to a provider:
//!
//! 1. Input fields referenced by the instructions template are rendered into the
//!    instructions and removed from the displayed input and input schema.
//! 2. Files are located in the input through the input schema. Text files are inlined,
//!    other files are attached to the user message.
//! 3. The user message is either a file marker (`Input is a single file`, `Input is an
//!    array of files`) or the pretty printed remaining input, followed by few-shot
//!    examples.
//! 4. The system message carries the instructions, the input schema when the input is
//!    shown and the output schema with its reserved fields.

mod files;
mod schema;
mod template;

pub use files::{check_capabilities, FileDownloader};
pub use schema::{
    collect_files, describe_tools, is_file_array_schema, is_file_schema, remove_properties,
    with_reserved_fields, ReservedFields,
};
pub use template::{referenced_variables, render};

use serde_json::Value;

use crate::error::RunError;
use crate::llm::{File, FileWithKeyPath, Message, PromptTemplate, ProviderError, ToolDefinition};
use crate::models::ModelCapabilities;
use crate::output::{AGENT_RUN_RESULT_KEY, REASONING_STEPS_KEY, TOOL_CALLS_KEY};
use crate::task::{FewShotExample, TaskVariant};

pub const SINGLE_FILE_INPUT: &str = "Input is a single file";
pub const FILE_ARRAY_INPUT: &str = "Input is an array of files";

/// Per-call rendering options. They depend on the candidate provider.
#[derive(Debug, Clone, Copy)]
pub struct PromptOptions<'a> {
    pub template: PromptTemplate,
    /// Output schema, already extended with reserved fields.
    pub output_schema: &'a Value,
    pub few_shot_examples: &'a [FewShotExample],
    pub chain_of_thought: bool,
    pub agent_run_result: bool,
    /// Tools the model calls through its output. Empty with native tool calling.
    pub output_tools: &'a [ToolDefinition],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputLayout {
    SingleFile,
    FileArray,
    Json,
}

/// Task input prepared for rendering.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    instructions: String,
    input: Value,
    input_schema: Value,
    files: Vec<FileWithKeyPath>,
}

impl MessageBuilder {
    pub fn new(task: &TaskVariant, instructions: &str, input: &Value) -> Self {
        let consumed = referenced_variables(instructions);
        let rendered = if consumed.is_empty() {
            instructions.to_string()
        } else {
            render(instructions, input)
        };
        let input_schema = remove_properties(&task.input_schema, &consumed);
        let input = schema::remove_input_fields(input, &consumed);
        let files = collect_files(&input_schema, &input);
        Self {
            instructions: rendered,
            input,
            input_schema,
            files,
        }
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn files(&self) -> &[FileWithKeyPath] {
        &self.files
    }

    /// Files sent as attachments, i.e. everything but text files.
    pub fn attachments(&self) -> impl Iterator<Item = &FileWithKeyPath> {
        self.files.iter().filter(|f| !f.file.is_text())
    }

    pub fn check_capabilities(&self, capabilities: &ModelCapabilities, model: &str) -> Result<(), RunError> {
        let attachments: Vec<FileWithKeyPath> = self.attachments().cloned().collect();
        check_capabilities(&attachments, capabilities, model)
    }

    /// Download text files, and the other files for which `needs_download` holds.
    pub async fn download_files<F>(&mut self, downloader: &FileDownloader, needs_download: F) -> Result<(), ProviderError>
    where
        F: Fn(&File) -> bool,
    {
        downloader
            .download_all(&mut self.files, |file| file.is_text() || needs_download(file))
            .await
    }

    /// The system and user messages, or a single user message for
    /// [`PromptTemplate::UserOnly`].
    pub fn build(&self, options: &PromptOptions<'_>) -> Vec<Message> {
        let mut input = self.input.clone();
        let mut input_schema = self.input_schema.clone();
        let mut attachments = Vec::new();
        let mut inlined_text = false;

        for f in &self.files {
            if f.file.is_text() {
                if let Some(text) = f.file.decoded_text() {
                    if crate::llm::set_at_key_path(&mut input, &f.key_path, Value::String(text)) {
                        schema::replace_with_string_schema(&mut input_schema, &f.key_path);
                        inlined_text = true;
                    }
                }
                continue;
            }
            // The model gets the bytes as an attachment, not in the JSON
            if f.file.has_data() {
                let mut shown = f.file.clone();
                shown.data = None;
                if let Ok(value) = serde_json::to_value(&shown) {
                    crate::llm::set_at_key_path(&mut input, &f.key_path, value);
                }
            }
            attachments.push(f.clone());
        }

        let layout = if inlined_text {
            InputLayout::Json
        } else {
            match schema::single_property(&input_schema) {
                Some((_, prop)) if is_file_schema(prop) => InputLayout::SingleFile,
                Some((_, prop)) if is_file_array_schema(&input_schema, prop) => InputLayout::FileArray,
                _ => InputLayout::Json,
            }
        };

        let system = self.system_content(options, &input_schema, layout);
        let user = user_content(&input, layout, options.few_shot_examples);

        match options.template {
            PromptTemplate::SystemAndUser => vec![
                Message::system(system),
                Message::user(user).with_files(attachments),
            ],
            PromptTemplate::UserOnly => {
                vec![Message::user(format!("{}\n\n{}", system, user)).with_files(attachments)]
            }
        }
    }

    fn system_content(&self, options: &PromptOptions<'_>, input_schema: &Value, layout: InputLayout) -> String {
        let mut sections: Vec<String> = Vec::new();

        let instructions = self.instructions.trim();
        if !instructions.is_empty() {
            sections.push(instructions.to_string());
        }

        if layout == InputLayout::Json {
            sections.push(format!(
                "Input will be provided in the user message using a JSON following the schema:\n```json\n{}\n```",
                pretty(input_schema)
            ));
        }

        if !options.output_tools.is_empty() {
            sections.push(format!(
                "You can call the following tools by listing them in the `{}` field of your answer. \
                 Their results are sent back in the next message:\n{}",
                TOOL_CALLS_KEY,
                describe_tools(options.output_tools)
            ));
        }

        if options.chain_of_thought {
            sections.push(format!(
                "Think step by step and describe your reasoning in the `{}` field before answering.",
                REASONING_STEPS_KEY
            ));
        }

        if options.agent_run_result {
            sections.push(format!(
                "If you cannot complete the task, set `{}.status` to \"failure\" and explain why in `error_message`.",
                AGENT_RUN_RESULT_KEY
            ));
        }

        sections.push(format!(
            "Return a single JSON object enforcing the following schema:\n```json\n{}\n```",
            pretty(options.output_schema)
        ));

        sections.join("\n\n")
    }
}

fn user_content(input: &Value, layout: InputLayout, examples: &[FewShotExample]) -> String {
    let mut content = match layout {
        InputLayout::SingleFile => SINGLE_FILE_INPUT.to_string(),
        InputLayout::FileArray => FILE_ARRAY_INPUT.to_string(),
        InputLayout::Json => format!("Input is:\n{}", pretty(input)),
    };
    if !examples.is_empty() {
        content.push_str("\n\nExamples:");
        for example in examples {
            content.push_str(&format!(
                "\n\nInput:\n{}\nOutput:\n{}",
                pretty(&example.input),
                pretty(&example.output)
            ));
        }
    }
    content
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
