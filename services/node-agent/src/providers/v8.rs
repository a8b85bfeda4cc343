//! JavaScript function workloads.
//!
//! The host checks that the script is UTF-8 and lexically sound; the guest
//! agent loads it into its interpreter.

use async_trait::async_trait;
use kiln_agent_api::WorkloadType;

use super::{
    verify_digest, ExecutionProvider, ExecutionProviderParams, GuestControl, ProviderContext,
    ProviderError,
};

pub struct V8Provider {
    params: ExecutionProviderParams,
    guest: GuestControl,
}

impl V8Provider {
    pub fn new(params: ExecutionProviderParams, ctx: ProviderContext) -> Self {
        let guest = GuestControl::new(ctx, params.machine_id);
        Self { params, guest }
    }
}

/// Tracks what the scanner is inside of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Paren,
    Bracket,
    Brace,
    /// `${ ... }` inside a template literal.
    Substitution,
}

/// Checks that brackets balance and that strings, template literals, regular
/// expression literals and comments are terminated. This is a tokenizer-level
/// check, not a parse.
pub(crate) fn check_js_lexically(source: &str) -> Result<(), String> {
    let chars: Vec<char> = source.chars().collect();
    let mut stack: Vec<Frame> = Vec::new();
    let mut i = 0;
    // Last significant character outside strings and comments; decides
    // whether `/` starts a regular expression or divides.
    let mut prev: Option<char> = None;

    let line_of = |pos: usize| chars[..pos.min(chars.len())].iter().filter(|c| **c == '\n').count() + 1;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let start = i;
                i += 2;
                loop {
                    if i + 1 >= chars.len() {
                        return Err(format!("unterminated comment at line {}", line_of(start)));
                    }
                    if chars[i] == '*' && chars[i + 1] == '/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
                continue;
            }
            '/' if regex_allowed(prev) => {
                i = skip_regex(&chars, i).ok_or_else(|| {
                    format!("unterminated regular expression at line {}", line_of(i))
                })?;
                prev = Some('/');
                continue;
            }
            '\'' | '"' => {
                i = skip_string(&chars, i, c)
                    .ok_or_else(|| format!("unterminated string at line {}", line_of(i)))?;
                prev = Some(c);
                continue;
            }
            '`' => {
                match skip_template(&chars, i + 1) {
                    TemplateEnd::Closed(next) => i = next,
                    TemplateEnd::Substitution(next) => {
                        stack.push(Frame::Substitution);
                        i = next;
                    }
                    TemplateEnd::Unterminated => {
                        return Err(format!("unterminated template literal at line {}", line_of(i)))
                    }
                }
                prev = Some('`');
                continue;
            }
            '(' => stack.push(Frame::Paren),
            '[' => stack.push(Frame::Bracket),
            '{' => stack.push(Frame::Brace),
            ')' | ']' | '}' => {
                let frame = stack.pop();
                match (c, frame) {
                    (')', Some(Frame::Paren)) | (']', Some(Frame::Bracket)) | ('}', Some(Frame::Brace)) => {}
                    ('}', Some(Frame::Substitution)) => {
                        match skip_template(&chars, i + 1) {
                            TemplateEnd::Closed(next) => i = next,
                            TemplateEnd::Substitution(next) => {
                                stack.push(Frame::Substitution);
                                i = next;
                            }
                            TemplateEnd::Unterminated => {
                                return Err(format!(
                                    "unterminated template literal at line {}",
                                    line_of(i)
                                ))
                            }
                        }
                        prev = Some('`');
                        continue;
                    }
                    _ => return Err(format!("unexpected '{c}' at line {}", line_of(i))),
                }
            }
            _ => {}
        }

        if !c.is_whitespace() {
            prev = Some(c);
        }
        i += 1;
    }

    match stack.last() {
        None => Ok(()),
        Some(frame) => Err(format!("unclosed {frame:?} at end of script")),
    }
}

fn regex_allowed(prev: Option<char>) -> bool {
    match prev {
        None => true,
        Some(c) => "(,=:[!&|?{};+-*%<>~^".contains(c),
    }
}

/// Index just past the closing quote.
fn skip_string(chars: &[char], start: usize, quote: char) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '\n' => return None,
            c if c == quote => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// Index just past the closing `/` and any flags.
fn skip_regex(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    let mut in_class = false;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '\n' => return None,
            '[' => {
                in_class = true;
                i += 1;
            }
            ']' => {
                in_class = false;
                i += 1;
            }
            '/' if !in_class => {
                i += 1;
                while i < chars.len() && chars[i].is_ascii_alphabetic() {
                    i += 1;
                }
                return Some(i);
            }
            _ => i += 1,
        }
    }
    None
}

enum TemplateEnd {
    Closed(usize),
    Substitution(usize),
    Unterminated,
}

/// Scans template text from `start` to the closing backtick or the next `${`.
fn skip_template(chars: &[char], start: usize) -> TemplateEnd {
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '`' => return TemplateEnd::Closed(i + 1),
            '$' if chars.get(i + 1) == Some(&'{') => return TemplateEnd::Substitution(i + 2),
            _ => i += 1,
        }
    }
    TemplateEnd::Unterminated
}

#[async_trait]
impl ExecutionProvider for V8Provider {
    fn workload_type(&self) -> WorkloadType {
        WorkloadType::V8
    }

    async fn validate(&self) -> Result<(), ProviderError> {
        verify_digest(&self.params.artifact, self.params.artifact_hash.as_deref())?;

        let source = std::str::from_utf8(&self.params.artifact)
            .map_err(|e| ProviderError::Validation(format!("script is not UTF-8: {e}")))?;
        if source.trim().is_empty() {
            return Err(ProviderError::Validation("script is empty".to_string()));
        }
        check_js_lexically(source).map_err(ProviderError::Validation)
    }

    async fn deploy(&self) -> Result<(), ProviderError> {
        self.guest.deploy(WorkloadType::V8, &self.params).await
    }

    async fn execute(&self, subject: &str, payload: Vec<u8>) -> Result<Vec<u8>, ProviderError> {
        self.guest.execute(WorkloadType::V8, subject, payload).await
    }

    async fn undeploy(&self) -> Result<(), ProviderError> {
        self.guest.undeploy().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, params, scripted_guest};
    use super::*;
    use kiln_agent_api::GuestReply;
    use rstest::rstest;

    #[rstest]
    #[case("module.exports = (s, p) => p;")]
    #[case("const a = [1, {b: (2)}];")]
    #[case("const s = 'a(b' + \"c]\";")]
    #[case("// comment with ( \nlet x = 1;")]
    #[case("/* { */ let y = 2;")]
    #[case("const t = `x ${ {a: 1}.a } y ${`nested ${1}`}`;")]
    #[case("const r = /[(]+\\//g.test(s);")]
    #[case("let z = a / b / c;")]
    fn test_lexically_valid(#[case] source: &str) {
        assert_eq!(check_js_lexically(source), Ok(()));
    }

    #[rstest]
    #[case("function f() {")]
    #[case("const a = [1, 2);")]
    #[case("const s = 'open;")]
    #[case("/* never closed")]
    #[case("const t = `abc;")]
    #[case("const t = `a ${ b `;")]
    #[case("}")]
    fn test_lexically_invalid(#[case] source: &str) {
        assert!(check_js_lexically(source).is_err());
    }

    #[tokio::test]
    async fn test_validate_rejects_empty_and_binary() {
        for artifact in [b"   \n".to_vec(), vec![0xff, 0xfe, 0x00]] {
            let (_bus, ctx) = context();
            let provider = V8Provider::new(params(Some("v8"), artifact), ctx);
            assert!(matches!(provider.validate().await, Err(ProviderError::Validation(_))));
        }
    }

    #[tokio::test]
    async fn test_calls_are_answered_by_guest() {
        let (bus, ctx) = context();
        let p = params(Some("v8"), b"module.exports = (s, p) => p;".to_vec());
        let _received = scripted_guest(&bus, &p.machine_id, |operation| match operation {
            "execute" => GuestReply::ok(b"from guest".to_vec()),
            _ => GuestReply::ok(Vec::new()),
        })
        .await;

        let provider = V8Provider::new(p, ctx);
        provider.validate().await.unwrap();
        provider.deploy().await.unwrap();
        let out = provider.execute("greet", b"hi".to_vec()).await.unwrap();
        assert_eq!(out, b"from guest");
        provider.undeploy().await.unwrap();
    }
}
