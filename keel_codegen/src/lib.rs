//! Build step library for Keel.
//! See the main library documentation for documentation on how to use Keel.

use anyhow::Result;
use proc_macro2::TokenStream;
use quote::{format_ident, quote, ToTokens};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use syn::{
    parse2,
    visit::{self, Visit},
    Ident, ItemConst, ItemFn, ItemMod, LitInt, LitStr, Macro,
};

#[doc(hidden)]
pub mod command;
#[doc(hidden)]
pub mod generate;
#[doc(hidden)]
pub mod msg_desc;
#[doc(hidden)]
pub mod output;
#[doc(hidden)]
pub mod reply;
#[doc(hidden)]
pub mod static_string;
mod utils;

use command::Command;
use generate::GenerateConfig;
use output::Output;
use reply::Reply;
use static_string::{Shutdown, StaticString, CORE_STATIC_STRINGS};
use utils::*;

/// Highest message id a two byte msgid can carry
const MSGID_MAX: u16 = 0x3FFF;
/// Static string ids below this are reserved
const STATIC_STRING_BASE: u16 = 2;
/// First id handed out after `identify_response` (0) and `identify` (1)
const FIRST_FREE_MSGID: u16 = 2;
const CONFIG_MODULE: &str = "_keel_config";

/// Build step for generating the dispatch table and data dictionary
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    entries: Vec<(PathBuf, Vec<Ident>)>,
    version: Option<String>,
    build_versions: Option<String>,
    skip_commands: BTreeSet<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder::default()
    }

    /// Adds an entry point
    ///
    /// The builder parses every entry and all the submodules reachable from it. Generally this is
    /// only `src/main.rs`.
    pub fn entry(self, path: impl AsRef<Path>) -> Self {
        self.entry_module(path, &[])
    }

    /// Like `entry` but with the module path of the file, e.g. `[gpio, sim]` for
    /// `crate::gpio::sim`
    pub fn entry_module(mut self, path: impl AsRef<Path>, module: &[Ident]) -> Self {
        self.entries.push((path.as_ref().to_owned(), module.to_vec()));
        self
    }

    /// Sets the version string placed in the dictionary
    pub fn set_version(mut self, version: impl AsRef<str>) -> Self {
        self.version = Some(version.as_ref().into());
        self
    }

    /// Sets the build versions string placed in the dictionary
    ///
    /// Klipper formats this as space separated `tool: version` pairs, but any string is accepted.
    pub fn set_build_versions(mut self, build_versions: impl AsRef<str>) -> Self {
        self.build_versions = Some(build_versions.as_ref().into());
        self
    }

    /// Leaves out the `keel_command` with the given name
    ///
    /// Prefer `#[cfg(feature = "...")]` on the command where possible.
    pub fn skip_command(mut self, command: impl AsRef<str>) -> Self {
        self.skip_commands.insert(command.as_ref().into());
        self
    }

    /// Runs the build step, writing `_keel_config.rs` to `OUT_DIR`
    pub fn build(self) {
        let mut processor = Processor::new(self.entries);
        if let Some(s) = self.version {
            processor.dictionary.version = s;
        }
        if let Some(s) = self.build_versions {
            processor.dictionary.build_versions = s;
        }

        if let Err(e) = processor.process_all() {
            if e.is::<syn::parse::Error>() {
                // Leave syntax errors to the compiler, which reports them far better
                return;
            }
            panic!("{:#}", e);
        }
        for cmd in &self.skip_commands {
            processor.messages.remove(cmd);
        }
        if let Err(e) = processor.finish() {
            panic!("{:#}", e);
        }

        let outfile = format!(
            "{}/{}.rs",
            env::var("OUT_DIR").expect("could not get OUT_DIR"),
            CONFIG_MODULE
        );
        let mut f = File::create(outfile).expect("Could not create output file");
        processor.write(&mut f).expect("Could not write config");
    }
}

#[derive(Debug)]
struct Task {
    path: PathBuf,
    module_path: Vec<Ident>,
}

#[derive(Debug, Eq, PartialEq)]
enum Message {
    Command(Command),
    Reply(Reply),
    Output(Output),
}

impl Message {
    fn id(&self) -> Option<u16> {
        match self {
            Message::Command(c) => c.id,
            Message::Reply(r) => r.id,
            Message::Output(o) => o.id,
        }
    }

    fn set_id(&mut self, id: u16) {
        match self {
            Message::Command(c) => c.id = Some(id),
            Message::Reply(r) => r.id = Some(id),
            Message::Output(o) => o.id = Some(id),
        }
    }
}

#[derive(Debug)]
struct Processor {
    queue: VecDeque<Task>,
    errors: Vec<anyhow::Error>,
    current_file: Option<PathBuf>,
    current_module: Vec<Ident>,

    messages: BTreeMap<String, Message>,
    static_strings: StaticStringsTracker,
    dictionary: Dictionary,
    generate_cfg: Option<GenerateConfig>,
}

/// Shutdown reasons in id order
#[derive(Debug)]
struct StaticStringsTracker {
    strings: Vec<StaticString>,
}

impl StaticStringsTracker {
    fn new() -> StaticStringsTracker {
        StaticStringsTracker {
            strings: CORE_STATIC_STRINGS
                .iter()
                .map(|(_, s)| StaticString(s.to_string()))
                .collect(),
        }
    }

    fn insert(&mut self, ss: StaticString) {
        if !self.strings.contains(&ss) {
            self.strings.push(ss);
        }
    }

    fn ids(&self) -> impl Iterator<Item = (&StaticString, u16)> {
        self.strings
            .iter()
            .zip(STATIC_STRING_BASE..)
    }
}

#[derive(Debug, Serialize, Default)]
struct Dictionary {
    build_versions: String,
    version: String,

    config: BTreeMap<String, serde_json::Value>,
    commands: BTreeMap<String, u16>,
    responses: BTreeMap<String, u16>,
    output: BTreeMap<String, u16>,
    enumerations: BTreeMap<String, BTreeMap<String, u16>>,
}

impl Dictionary {
    fn to_compressed(&self) -> Vec<u8> {
        let mut e = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        serde_json::to_writer(&mut e, self).expect("Could not serialize data dictionary");
        e.finish().expect("Could not compress data dictionary")
    }
}

macro_rules! check_error {
    ($self:ident, $expr:expr) => {
        if let Err(e) = $expr {
            $self.errors.push(e);
        }
    };
}

impl<'ast> Visit<'ast> for Processor {
    fn visit_macro(&mut self, node: &'ast Macro) {
        match node.path.get_ident().map(Ident::to_string).as_deref() {
            Some("keel_shutdown") => check_error!(self, self.process_shutdown(node)),
            Some("keel_reply") => check_error!(self, self.process_reply(node)),
            Some("keel_output") => check_error!(self, self.process_output(node)),
            Some("keel_config_generate") => {
                check_error!(self, self.process_config_generate(node))
            }
            _ => {}
        }
        visit::visit_macro(self, node);
    }

    fn visit_item_fn(&mut self, node: &'ast ItemFn) {
        if !check_is_enabled(&node.attrs) {
            return;
        }
        if let Some(attr) = node.attrs.iter().find(|a| a.path.is_ident("keel_command")) {
            check_error!(self, self.process_command(node, attr));
        }
        visit::visit_item_fn(self, node);
    }

    fn visit_item_const(&mut self, node: &'ast ItemConst) {
        if node.attrs.iter().any(|a| a.path.is_ident("keel_constant")) {
            check_error!(self, self.process_constant(node));
        }
        visit::visit_item_const(self, node)
    }

    fn visit_item_mod(&mut self, node: &'ast ItemMod) {
        if check_is_disabled(&node.attrs) {
            return;
        }
        if node.content.is_none() {
            check_error!(self, self.queue_submodule(&node.ident));
            return;
        }
        self.current_module.push(node.ident.clone());
        visit::visit_item_mod(self, node);
        self.current_module.pop();
    }
}

impl Processor {
    fn new(entries: Vec<(PathBuf, Vec<Ident>)>) -> Processor {
        let mut processor = Processor {
            queue: entries
                .into_iter()
                .map(|(path, module_path)| Task { path, module_path })
                .collect(),
            errors: vec![],
            current_file: None,
            current_module: vec![],

            messages: BTreeMap::new(),
            static_strings: StaticStringsTracker::new(),
            dictionary: Dictionary::default(),
            generate_cfg: None,
        };
        processor.add_builtin_messages();
        processor
    }

    fn process_all(&mut self) -> Result<()> {
        while let Some(next) = self.queue.pop_front() {
            self.process_one(next)?;
        }
        Ok(())
    }

    fn process_one(&mut self, task: Task) -> Result<()> {
        println!("cargo:rerun-if-changed={}", task.path.display());
        let content = std::fs::read_to_string(&task.path)?;
        self.current_file = Some(task.path);
        self.current_module = task.module_path;
        self.process_source(&content)
    }

    fn process_source(&mut self, content: &str) -> Result<()> {
        let ast = syn::parse_file(content)?;
        self.visit_file(&ast);
        match self.errors.pop() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn queue_submodule(&mut self, name: &Ident) -> Result<()> {
        let mut module_path = self.current_module.clone();
        module_path.push(name.clone());
        if module_path == [CONFIG_MODULE] {
            return Ok(());
        }

        let base = self
            .current_file
            .as_ref()
            .and_then(|p| p.parent())
            .ok_or_else(|| anyhow::anyhow!("No current file?"))?;
        // Submodules of a non-root file live in a directory named after it
        let stem = self
            .current_file
            .as_ref()
            .and_then(|p| p.file_stem())
            .and_then(|s| s.to_str());
        let base = match stem {
            Some(stem) if !matches!(stem, "main" | "lib" | "mod") => base.join(stem),
            _ => base.to_owned(),
        };

        let candidates: Vec<_> = [
            base.join(format!("{}.rs", name)),
            base.join(name.to_string()).join("mod.rs"),
        ]
        .into_iter()
        .filter(|p| p.exists())
        .collect();

        let file = match candidates.as_slice() {
            [file] => file.clone(),
            [] => anyhow::bail!("Cannot find either {}.rs or {}/mod.rs", name, name),
            _ => anyhow::bail!(
                "Both {}.rs and {}/mod.rs exist. Remove one to break ambiguity.",
                name,
                name
            ),
        };
        self.queue.push_back(Task {
            path: file,
            module_path,
        });
        Ok(())
    }

    fn process_shutdown(&mut self, mac: &Macro) -> Result<()> {
        let ss = mac.parse_body::<Shutdown>()?;
        self.static_strings.insert(ss.msg);
        Ok(())
    }

    fn process_command(&mut self, func: &ItemFn, attr: &syn::Attribute) -> Result<()> {
        let mut c = parse2::<Command>(func.to_token_stream())?;
        for flag in marker_flags(attr)? {
            match flag.to_string().as_str() {
                "in_shutdown" => c.in_shutdown = true,
                other => anyhow::bail!("Unknown command flag '{}' on {}", other, c.name),
            }
        }
        c.module = Some(self.current_module.clone());
        self.add_message(c.name.to_string(), Message::Command(c));
        Ok(())
    }

    fn process_reply(&mut self, mac: &Macro) -> Result<()> {
        let mut reply = parse2::<Reply>(mac.tokens.clone())?;
        reply.clear_arg_values();
        self.add_message(reply.name.to_string(), Message::Reply(reply));
        Ok(())
    }

    fn process_output(&mut self, mac: &Macro) -> Result<()> {
        let mut output = parse2::<Output>(mac.tokens.clone())?;
        output.clear_arg_values();
        self.add_message(output.format.clone(), Message::Output(output));
        Ok(())
    }

    fn process_config_generate(&mut self, mac: &Macro) -> Result<()> {
        if self.generate_cfg.is_some() {
            anyhow::bail!("Multiple keel_config_generate calls found!");
        }
        self.generate_cfg = Some(parse2::<GenerateConfig>(mac.tokens.clone())?);
        Ok(())
    }

    fn process_constant(&mut self, node: &ItemConst) -> Result<()> {
        if check_is_disabled(&node.attrs) {
            return Ok(());
        }

        let name = node.ident.to_string();
        let expr = node.expr.to_token_stream();
        let value: serde_json::Value = if let Ok(v) = parse2::<LitInt>(expr.clone()) {
            v.base10_parse::<u32>()?.into()
        } else if let Ok(v) = parse2::<LitStr>(expr) {
            v.value().into()
        } else {
            anyhow::bail!(
                "Can't understand constant {}, only integer and string literals are supported",
                name
            );
        };

        if self.dictionary.config.contains_key(&name) {
            panic!("Multiple definitions for keel constant {}", name);
        }
        self.dictionary.config.insert(name, value);
        Ok(())
    }

    fn add_message(&mut self, name: String, message: Message) {
        if let Some(current) = self.messages.get(&name) {
            if current != &message {
                panic!("A message named {} already exists", name);
            }
        }
        self.messages.insert(name, message);
    }

    fn add_builtin_messages(&mut self) {
        self.add_message(
            "identify_response".into(),
            Message::Reply(Reply {
                name: format_ident!("identify_response"),
                id: Some(0),
                args: vec![
                    reply::Arg::declared("offset", "u32"),
                    reply::Arg::declared("data", "&[u8]"),
                ],
            }),
        );
        self.add_message(
            "identify".into(),
            Message::Command(Command {
                name: format_ident!("identify"),
                id: Some(1),
                handler_name: format_ident!("handle_identify"),
                module: None,
                has_context: false,
                in_shutdown: true,
                args: vec![
                    command::Arg {
                        name: format_ident!("offset"),
                        type_: syn::parse_str("u32").unwrap(),
                    },
                    command::Arg {
                        name: format_ident!("count"),
                        type_: syn::parse_str("u8").unwrap(),
                    },
                ],
            }),
        );
        self.add_message(
            "shutdown".into(),
            Message::Reply(Reply {
                name: format_ident!("shutdown"),
                id: None,
                args: vec![
                    reply::Arg::declared("clock", "u32"),
                    reply::Arg::declared("static_string_id", "u16"),
                ],
            }),
        );
        self.add_message(
            "is_shutdown".into(),
            Message::Reply(Reply {
                name: format_ident!("is_shutdown"),
                id: None,
                args: vec![reply::Arg::declared("static_string_id", "u16")],
            }),
        );
    }

    fn finish(&mut self) -> Result<()> {
        self.assign_ids();
        self.check_frame_sizes()?;
        self.finalize_dictionary();
        Ok(())
    }

    /// Rejects messages whose integers alone overflow a frame
    fn check_frame_sizes(&self) -> Result<()> {
        for (name, m) in &self.messages {
            let id = m.id().expect("ids are assigned");
            let needed = match m {
                Message::Command(c) => msg_desc::min_frame_size(id, c.args.iter().map(|a| &a.type_)),
                Message::Reply(r) => msg_desc::min_frame_size(id, r.args.iter().map(|a| &a.type_)),
                Message::Output(o) => msg_desc::min_frame_size(id, o.args.iter().map(|a| &a.type_)),
            };
            if needed > msg_desc::MESSAGE_MAX {
                anyhow::bail!(
                    "Message '{}' needs {} bytes, more than a {} byte frame",
                    name,
                    needed,
                    msg_desc::MESSAGE_MAX
                );
            }
        }
        Ok(())
    }

    /// Gives every message without a fixed id the lowest free one
    fn assign_ids(&mut self) {
        let mut used_ids: BTreeSet<u16> = self.messages.values().filter_map(Message::id).collect();
        let mut next_id = FIRST_FREE_MSGID;
        for m in self.messages.values_mut().filter(|m| m.id().is_none()) {
            while used_ids.contains(&next_id) {
                next_id += 1;
            }
            if next_id > MSGID_MAX {
                panic!("Too many messages");
            }
            used_ids.insert(next_id);
            m.set_id(next_id);
        }
    }

    fn finalize_dictionary(&mut self) {
        for m in self.messages.values() {
            let id = m.id().expect("ids are assigned");
            match m {
                Message::Command(c) => {
                    self.dictionary.commands.insert(c.get_desc_string(), id);
                }
                Message::Reply(r) => {
                    self.dictionary.responses.insert(r.get_desc_string(), id);
                }
                Message::Output(o) => {
                    self.dictionary.output.insert(o.format.clone(), id);
                }
            }
        }
        let static_string_ids = self
            .static_strings
            .ids()
            .map(|(ss, id)| (ss.0.clone(), id))
            .collect();
        self.dictionary
            .enumerations
            .insert("static_string_id".to_string(), static_string_ids);
    }

    fn generate(&self) -> Result<TokenStream> {
        let cfg = self
            .generate_cfg
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No keel_config_generate! call found"))?;
        let (transport_name, transport_type) = &cfg.transport;
        let context = match &cfg.context {
            Some(ty) => ty.to_token_stream(),
            None => quote! { () },
        };

        let message_handlers = self.write_message_handlers();
        let command_table = self.write_command_table()?;
        let static_strings = self.write_static_strings();
        let data_dictionary = self.write_data_dictionary();

        Ok(quote! {
            type Output = &'static #transport_type;
            type Context = #context;

            pub mod message_handlers {
                use super::*;
                #(#message_handlers)*
            }

            #command_table
            #static_strings

            pub(crate) static TABLE: ::keel::CommandTable<Context> = ::keel::CommandTable {
                commands: &COMMANDS,
                static_strings: &STATIC_STRINGS,
                shutdown: message_handlers::REPLY_SHUTDOWN,
                is_shutdown: message_handlers::REPLY_IS_SHUTDOWN,
            };
            pub(crate) static SHUTDOWN: ::keel::ShutdownState = ::keel::ShutdownState::new();
            pub(crate) static ENGINE: ::keel::Engine<'static, Context, Output> =
                ::keel::Engine::new(&TABLE, &SHUTDOWN, &#transport_name);

            #data_dictionary
        })
    }

    fn write(self, target: &mut impl Write) -> Result<()> {
        write!(target, "{}", self.generate()?)?;
        Ok(())
    }

    fn write_command_table(&self) -> Result<TokenStream> {
        let mut slots: BTreeMap<u16, TokenStream> = BTreeMap::new();
        let mut max_id = 0;
        for m in self.messages.values() {
            let id = m.id().expect("ids are assigned");
            max_id = max_id.max(id);
            if let Message::Command(c) = m {
                let name = c.name.to_string();
                let params = c.param_list();
                let handler = c.handler_fn_name();
                let flags = if c.in_shutdown {
                    quote! { ::keel::CommandFlags::IN_SHUTDOWN }
                } else {
                    quote! { ::keel::CommandFlags::NONE }
                };
                if slots.contains_key(&id) {
                    anyhow::bail!("Multiple entries for command ID {}", id);
                }
                slots.insert(
                    id,
                    quote! {
                        Some(::keel::CommandDescriptor {
                            name: #name,
                            params: #params,
                            flags: #flags,
                            handler: message_handlers::#handler,
                        })
                    },
                );
            }
        }

        let entries: Vec<_> = (0..=max_id)
            .map(|id| slots.remove(&id).unwrap_or_else(|| quote! { None }))
            .collect();
        let len = entries.len();
        Ok(quote! {
            pub(crate) static COMMANDS: [Option<::keel::CommandDescriptor<Context>>; #len] = [#(#entries),*];
        })
    }

    fn write_message_handlers(&self) -> Vec<TokenStream> {
        self.messages
            .values()
            .map(|m| match m {
                Message::Command(c) => {
                    let handler_name = c.handler_fn_name();
                    let target = c.target();
                    let bindings = c.args.iter().enumerate().map(|(idx, arg)| {
                        let name = &arg.name;
                        let ty = &arg.type_;
                        quote! { let #name: #ty = args.value(#idx)?; }
                    });
                    let names = c.args.iter().map(|a| &a.name);
                    let ctx_arg = c.has_context.then(|| quote! { context, });
                    quote! {
                        #[allow(unused_variables)]
                        pub(crate) fn #handler_name(context: &mut Context, args: &::keel::Args<'_>) -> Result<(), ::keel::Shutdown> {
                            #(#bindings)*
                            ::keel::CommandResult::into_result(#target(#ctx_arg #(#names),*))
                        }
                    }
                }
                Message::Reply(r) => {
                    let id = r.id.expect("ids are assigned");
                    let encoder = r.encoder_name();
                    let sender = r.sender_fn_name();
                    let params = r.param_list();
                    let max_size = r.max_frame_size(id);
                    let names: Vec<_> = r.args.iter().map(|a| &a.name).collect();
                    let types = r.args.iter().map(|a| &a.type_);
                    quote! {
                        pub const #encoder: ::keel::EncoderDescriptor =
                            ::keel::EncoderDescriptor::new(#id, #params, #max_size);
                        pub fn #sender(#(#names: #types),*) {
                            super::ENGINE.send(&#encoder, &[#(#names.into()),*]);
                        }
                    }
                }
                Message::Output(o) => {
                    let id = o.id.expect("ids are assigned");
                    let encoder = o.encoder_name();
                    let sender = o.sender_fn_name();
                    let params = o.param_list();
                    let max_size = o.max_frame_size(id);
                    let names: Vec<_> = (0..o.args.len()).map(|i| format_ident!("arg_{}", i)).collect();
                    let types = o.args.iter().map(|a| &a.type_);
                    quote! {
                        pub const #encoder: ::keel::EncoderDescriptor =
                            ::keel::EncoderDescriptor::new(#id, #params, #max_size);
                        pub fn #sender(#(#names: #types),*) {
                            super::ENGINE.send(&#encoder, &[#(#names.into()),*]);
                        }
                    }
                }
            })
            .collect()
    }

    fn write_static_strings(&self) -> TokenStream {
        let strings: Vec<_> = self.static_strings.strings.iter().map(|ss| &ss.0).collect();
        let len = strings.len();
        quote! {
            pub(crate) static STATIC_STRINGS: [&str; #len] = [#(#strings),*];
        }
    }

    fn write_data_dictionary(&self) -> TokenStream {
        let data = self.dictionary.to_compressed();
        let len = data.len();
        quote! {
            pub(crate) static DATA: [u8; #len] = [#(#data),*];

            fn handle_identify(offset: u32, count: u8) {
                let len = DATA.len() as u32;
                let start = offset.min(len);
                let end = offset.saturating_add(count as u32).min(len);
                message_handlers::send_reply_identify_response(offset, &DATA[start as usize..end as usize]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    const SOURCE: &str = r#"
        keel_config_generate!(
            transport = crate::console::TRANSPORT_OUTPUT: crate::console::PtyOutput,
            context = crate::State,
        );

        #[keel_constant]
        const CLOCK_FREQ: u32 = 1_000_000;

        #[keel_constant]
        const MCU: &str = "hostmcu";

        #[keel_command]
        fn get_clock(ctx: &mut State) {
            keel_reply!(clock, clock: u32 = ctx.now());
        }

        #[keel_command(in_shutdown)]
        fn clear_shutdown(ctx: &mut State) -> Result<(), Shutdown> {
            if ctx.bad() {
                return Err(keel_shutdown!("Clear refused"));
            }
            keel_output!("cleared after %u tries", ctx.tries());
            Ok(())
        }

        #[cfg(feature = "keel-never-set")]
        #[keel_command]
        fn hidden() {}

        mod inline {
            #[keel_command]
            fn nested(oid: u8, data: &[u8]) {}
        }
    "#;

    fn processor() -> Processor {
        let mut p = Processor::new(vec![]);
        p.process_source(SOURCE).unwrap();
        p.finish().unwrap();
        p
    }

    fn id_of(p: &Processor, name: &str) -> u16 {
        p.messages[name].id().unwrap()
    }

    #[test]
    fn builtin_ids_are_fixed() {
        let p = processor();
        assert_eq!(id_of(&p, "identify_response"), 0);
        assert_eq!(id_of(&p, "identify"), 1);
    }

    #[test]
    fn ids_are_unique_and_dense() {
        let p = processor();
        let ids: BTreeSet<u16> = p.messages.values().map(|m| m.id().unwrap()).collect();
        assert_eq!(ids.len(), p.messages.len());
        assert_eq!(ids.iter().copied().max().unwrap() as usize, p.messages.len() - 1);
        assert_eq!(ids.range(FIRST_FREE_MSGID..).next(), Some(&FIRST_FREE_MSGID));
        assert!(!p.messages.contains_key("hidden"));
    }

    #[test]
    fn command_flags_and_modules() {
        let p = processor();
        match &p.messages["clear_shutdown"] {
            Message::Command(c) => assert!(c.in_shutdown),
            other => panic!("unexpected {:?}", other),
        }
        match &p.messages["nested"] {
            Message::Command(c) => {
                assert_eq!(c.module.as_deref(), Some(&[format_ident!("inline")][..]));
                assert!(!c.in_shutdown);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn user_static_strings_follow_core_reasons() {
        let p = processor();
        let ids: BTreeMap<_, _> = p.static_strings.ids().map(|(s, id)| (s.0.as_str(), id)).collect();
        assert_eq!(ids["Invalid command"], 2);
        assert_eq!(ids["Command parser error"], 3);
        assert_eq!(ids["Clear refused"], 2 + CORE_STATIC_STRINGS.len() as u16);
    }

    #[test]
    fn dictionary_round_trips_through_zlib() {
        let p = processor();
        let mut json = String::new();
        flate2::read::ZlibDecoder::new(&p.dictionary.to_compressed()[..])
            .read_to_string(&mut json)
            .unwrap();
        let dict: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(dict["commands"]["identify offset=%u count=%c"], 1);
        assert_eq!(dict["responses"]["identify_response offset=%u data=%*s"], 0);
        assert!(dict["responses"]["shutdown clock=%u static_string_id=%hu"].is_number());
        assert!(dict["output"]["cleared after %u tries"].is_number());
        assert_eq!(dict["config"]["CLOCK_FREQ"], 1_000_000);
        assert_eq!(dict["config"]["MCU"], "hostmcu");
        assert_eq!(dict["enumerations"]["static_string_id"]["Timer too close"], 6);
    }

    #[test]
    fn generated_code_parses() {
        let p = processor();
        let code = p.generate().unwrap();
        let file: syn::File = syn::parse2(code).unwrap();
        let statics: Vec<String> = file
            .items
            .iter()
            .filter_map(|i| match i {
                syn::Item::Static(s) => Some(s.ident.to_string()),
                _ => None,
            })
            .collect();
        for name in ["COMMANDS", "STATIC_STRINGS", "TABLE", "SHUTDOWN", "ENGINE", "DATA"] {
            assert!(statics.iter().any(|s| s == name), "missing {}", name);
        }
    }

    #[test]
    fn missing_generate_call_is_an_error() {
        let mut p = Processor::new(vec![]);
        p.process_source("#[keel_command] fn nop() {}").unwrap();
        p.finish().unwrap();
        assert!(p.generate().is_err());
    }

    #[test]
    fn oversized_reply_fails_the_build() {
        let mut p = Processor::new(vec![]);
        p.process_source(
            r#"
            #[keel_command]
            fn dump() {
                keel_reply!(
                    dump_state,
                    a: u32 = 0, b: u32 = 0, c: u32 = 0, d: u32 = 0, e: u32 = 0, f: u32 = 0,
                    g: u32 = 0, h: u32 = 0, i: u32 = 0, j: u32 = 0, k: u32 = 0, l: u32 = 0
                );
            }
            "#,
        )
        .unwrap();
        let err = p.finish().unwrap_err();
        assert!(err.to_string().contains("dump_state"), "{}", err);
    }

    #[test]
    fn truncatable_buffer_reply_fits() {
        let mut p = Processor::new(vec![]);
        p.process_source(
            r#"
            #[keel_command]
            fn read(oid: u8) {
                keel_reply!(read_response, oid: u8 = oid, data: &[u8] = &[]);
            }
            "#,
        )
        .unwrap();
        p.finish().unwrap();
        assert_eq!(id_of(&p, "identify"), 1);
    }
}
