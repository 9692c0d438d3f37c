use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use zhixia::api::OpenRouterClient;
use zhixia::app::{App, SlotView};
use zhixia::debounce::work_autosaver;
use zhixia::events::{forward_fragments, GenerationEvent};
use zhixia::generation::{creative_request, GenerateOptions, GenerationDefaults, Generator};
use zhixia::models::{AppConfig, CreativeMapType, NewPrompt, NewWork, PromptType, Work};
use zhixia::slots::{self, SlotRegistry};
use zhixia::storage::Storage;
use zhixia::{
    append_to_chapter, config, put_chapter, split_or_whole, Chapter, ChapterFormatter, SessionState,
};

#[derive(Parser)]
#[command(name = "zhixia", version, about = "Creative-writing assistant")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store the API key used for generation
    SetKey { key: String },
    /// Import a plain-text manuscript as a new novel
    Import {
        file: PathBuf,
        #[arg(long)]
        title: Option<String>,
    },
    /// List works
    Works,
    /// List the chapters of a work
    Chapters { work_id: u64 },
    /// Replace a chapter's text from a file, or append one at the end
    EditChapter {
        work_id: u64,
        index: usize,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        title: Option<String>,
    },
    /// List known models
    Models,
    /// Analyse selected chapters of a work
    Analyze {
        work_id: u64,
        /// Zero-based chapter indices, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        chapters: Vec<usize>,
        #[arg(long, conflicts_with = "prompt_id", required_unless_present = "prompt_id")]
        prompt: Option<String>,
        #[arg(long)]
        prompt_id: Option<u64>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Write with a writing prompt, optionally over selected chapters, and
    /// append the result to a chapter
    Write {
        work_id: u64,
        /// Zero-based chapter indices sent as context, comma separated
        #[arg(long, value_delimiter = ',')]
        chapters: Vec<usize>,
        #[arg(long, conflicts_with = "prompt_id", required_unless_present = "prompt_id")]
        prompt: Option<String>,
        #[arg(long)]
        prompt_id: Option<u64>,
        /// Chapter that receives the generated text
        #[arg(long)]
        into: Option<usize>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Free-form generation
    Generate {
        text: String,
        #[arg(long)]
        no_stream: bool,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Run a creative map tool and save the result
    Creative {
        /// introduction, outline, detailed_outline, character, worldbuilding or plot
        kind: String,
        #[arg(long, default_value = "")]
        input: String,
        #[arg(long)]
        prompt_id: Option<u64>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// List saved prompts
    Prompts {
        #[arg(long = "type")]
        prompt_type: Option<String>,
    },
    /// Save a prompt template
    AddPrompt {
        #[arg(long = "type")]
        prompt_type: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        content: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long = "example")]
        examples: Vec<String>,
    },
}

#[derive(Args)]
struct ModelArgs {
    #[arg(long)]
    model: Option<String>,
    /// System instruction sent ahead of the content
    #[arg(long)]
    system: Option<String>,
    #[arg(long)]
    no_system: bool,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    max_tokens: Option<u32>,
}

impl ModelArgs {
    fn options(&self) -> GenerateOptions {
        GenerateOptions {
            model: self.model.clone(),
            system_prompt: self.system.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_tokens,
            disable_system_prompt: self.no_system,
        }
    }
}

struct Runtime {
    storage: Storage,
    generator: Generator,
    slots: SlotRegistry,
    autosave: Duration,
}

impl Runtime {
    fn new(config: &AppConfig) -> Result<Self> {
        let storage = Storage::new()?;
        let transport = Arc::new(OpenRouterClient::from_config(config)?);
        let generator = Generator::new(
            Arc::new(storage.clone()),
            transport,
            GenerationDefaults::from(config),
        );
        Ok(Self {
            storage,
            generator,
            slots: SlotRegistry::new(Duration::from_millis(config.slot_grace_ms)),
            autosave: Duration::from_millis(config.autosave_debounce_ms),
        })
    }

    /// Store `chapters` on `work` through the debounced autosaver, flushing before return.
    async fn save_chapters(&self, mut work: Work, chapters: &[Chapter]) -> Result<()> {
        work.set_chapters(chapters).context("Failed to encode chapters")?;
        let autosaver = work_autosaver(self.storage.clone(), self.autosave);
        autosaver.push(work);
        autosaver.shutdown().await;
        Ok(())
    }

    /// Stream a generation for `slot` to stdout. Ctrl-C cancels it.
    async fn stream(&self, slot: &str, content: String, options: GenerateOptions) -> Result<(SlotView, SessionState)> {
        let session = self.slots.begin(slot).await;
        let mut app = App::new();
        app.start(slot);

        let (tx, mut rx) = mpsc::unbounded_channel::<GenerationEvent>();
        let task = {
            let generator = self.generator.clone();
            let session = session.clone();
            tokio::spawn(async move {
                let result = generator
                    .generate_stream(&content, &options, &session, forward_fragments(tx.clone()))
                    .await;
                let _ = tx.send(GenerationEvent::from_result(result));
            })
        };
        let interrupt = {
            let session = session.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    session.cancel();
                }
            })
        };

        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            if let GenerationEvent::Fragment(fragment) = &event {
                write!(stdout, "{fragment}")?;
                stdout.flush()?;
            }
            let terminal = event.is_terminal();
            app.handle_event(slot, event);
            if terminal {
                break;
            }
        }
        writeln!(stdout)?;

        interrupt.abort();
        task.await.context("Generation task failed")?;
        self.slots.finish(slot, &session);

        let view = app.view(slot).cloned().unwrap_or_default();
        Ok((view, session.state()))
    }
}

fn banner(view: &SlotView) -> Result<()> {
    match &view.error {
        Some(error) => anyhow::bail!("{error}"),
        None => Ok(()),
    }
}

/// Prompt text given inline, or loaded from a saved prompt of `prompt_type`.
fn resolve_prompt(
    storage: &Storage,
    prompt: Option<String>,
    prompt_id: Option<u64>,
    prompt_type: PromptType,
) -> Result<String> {
    let prompt = match (prompt, prompt_id) {
        (Some(prompt), _) => prompt,
        (None, Some(id)) => storage.get_prompt_of_type(id, prompt_type)?.content,
        (None, None) => anyhow::bail!("Either --prompt or --prompt-id is required"),
    };
    if prompt.trim().is_empty() {
        anyhow::bail!("请输入提示词，提示词不能为空");
    }
    Ok(prompt)
}

fn parse_prompt_type(value: &str) -> Result<PromptType> {
    PromptType::parse(value).ok_or_else(|| anyhow::anyhow!("Unknown prompt type: {value}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("zhixia=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load_config()?;
    let runtime = Runtime::new(&config)?;

    if !runtime.storage.has_visited()? {
        eprintln!("欢迎使用知夏。先运行 `zhixia set-key <KEY>` 配置 API 密钥。");
        runtime.storage.mark_visited()?;
    }

    run(&runtime, cli.command).await
}

async fn run(runtime: &Runtime, command: Command) -> Result<()> {
    let storage = &runtime.storage;

    match command {
        Command::SetKey { key } => {
            storage.save_api_key(&key)?;
            println!("API key saved");
        }
        Command::Import { file, title } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let title = title.unwrap_or_else(|| {
                file.file_stem()
                    .map_or_else(|| "未命名作品".to_string(), |stem| stem.to_string_lossy().into_owned())
            });

            let chapters = split_or_whole(&text);
            let mut work = storage.add_work(NewWork::novel(title))?;
            work.set_chapters(&chapters).context("Failed to encode chapters")?;
            storage.update_work(&work)?;
            println!("Imported work {} \"{}\" with {} chapters", work.id, work.title, chapters.len());
        }
        Command::Works => {
            for work in storage.list_works()? {
                println!(
                    "{:>4}  {}  ({} chapters, updated {})",
                    work.id,
                    work.title,
                    work.chapters().len(),
                    work.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Command::Chapters { work_id } => {
            let work = storage
                .get_work(work_id)?
                .ok_or_else(|| anyhow::anyhow!("Work {work_id} not found"))?;
            for (index, chapter) in work.chapters().iter().enumerate() {
                println!("{index:>4}  {}  ({} chars)", chapter.title, chapter.content.chars().count());
            }
        }
        Command::EditChapter {
            work_id,
            index,
            file,
            title,
        } => {
            let work = storage
                .get_work(work_id)?
                .ok_or_else(|| anyhow::anyhow!("Work {work_id} not found"))?;
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let mut chapters = work.chapters();
            if !put_chapter(&mut chapters, index, title, content) {
                anyhow::bail!("Chapter index {index} out of range (work has {})", chapters.len());
            }
            runtime.save_chapters(work, &chapters).await?;
            println!("Saved chapter {index}");
        }
        Command::Models => {
            for model in config::load_models()? {
                println!("{}  {}  (max {} tokens)", model.name, model.label, model.max_output_tokens);
            }
        }
        Command::Analyze {
            work_id,
            chapters,
            prompt,
            prompt_id,
            model,
        } => {
            let work = storage
                .get_work(work_id)?
                .ok_or_else(|| anyhow::anyhow!("Work {work_id} not found"))?;
            let prompt = resolve_prompt(storage, prompt, prompt_id, PromptType::Analysis)?;
            let mut options = model.options();
            if options.system_prompt.is_none() {
                options.system_prompt = Some(prompt.clone());
            }
            let content = ChapterFormatter::format_prompt(&work.chapters(), &chapters, &prompt);
            let (view, _) = runtime.stream(slots::SLOT_ANALYSIS, content, options).await?;
            banner(&view)?;
        }
        Command::Generate { text, no_stream, model } => {
            let options = model.options();
            if no_stream {
                match runtime.generator.generate(&text, &options).await {
                    Ok(result) => println!("{result}"),
                    Err(e) => anyhow::bail!("{}", e.user_message().unwrap_or_default()),
                }
            } else {
                let (view, _) = runtime.stream(slots::SLOT_WRITING, text, options).await?;
                banner(&view)?;
            }
        }
        Command::Write {
            work_id,
            chapters,
            prompt,
            prompt_id,
            into,
            model,
        } => {
            let work = storage
                .get_work(work_id)?
                .ok_or_else(|| anyhow::anyhow!("Work {work_id} not found"))?;
            let prompt = resolve_prompt(storage, prompt, prompt_id, PromptType::Writing)?;
            let mut current = work.chapters();
            if let Some(index) = into {
                if index >= current.len() {
                    anyhow::bail!("Chapter index {index} out of range (work has {})", current.len());
                }
            }

            let mut options = model.options();
            if options.system_prompt.is_none() {
                options.system_prompt = Some(prompt.clone());
            }
            let content = if chapters.is_empty() {
                prompt
            } else {
                ChapterFormatter::format_prompt(&current, &chapters, &prompt)
            };
            let (view, state) = runtime.stream(slots::SLOT_WRITING, content, options).await?;
            banner(&view)?;

            if let Some(index) = into {
                if state == SessionState::Completed
                    && !view.result.is_empty()
                    && append_to_chapter(&mut current, index, &view.result)
                {
                    runtime.save_chapters(work, &current).await?;
                    println!("Appended to chapter {index}");
                }
            }
        }
        Command::Creative {
            kind,
            input,
            prompt_id,
            title,
            model,
        } => {
            let kind = CreativeMapType::parse(&kind)
                .ok_or_else(|| anyhow::anyhow!("Unknown creative map type: {kind}"))?;
            let instruction = match prompt_id {
                Some(id) => storage.get_prompt_of_type(id, kind.prompt_type())?.content,
                None => kind.default_template().to_string(),
            };

            let (content, mut options) = creative_request(&input, &instruction);
            options.model = model;
            let (view, state) = runtime
                .stream(slots::SLOT_CREATIVE_MAP, content, options)
                .await?;
            banner(&view)?;

            if state == SessionState::Completed && !view.result.is_empty() {
                let title = title.unwrap_or_else(|| kind.display_name().to_string());
                let item = storage.add_creative_item(kind, title, view.result)?;
                println!("Saved as {}", item.id);
            }
        }
        Command::Prompts { prompt_type } => {
            let prompts = match prompt_type {
                Some(value) => storage.list_prompts_by_type(parse_prompt_type(&value)?)?,
                None => storage.list_prompts()?,
            };
            for prompt in prompts {
                println!("{:>4}  [{}]  {}", prompt.id, prompt.prompt_type.as_str(), prompt.title);
            }
        }
        Command::AddPrompt {
            prompt_type,
            title,
            content,
            description,
            examples,
        } => {
            let prompt = storage.add_prompt(NewPrompt {
                title,
                prompt_type: parse_prompt_type(&prompt_type)?,
                content,
                description,
                examples,
            })?;
            println!("Saved prompt {}", prompt.id);
        }
    }

    Ok(())
}
