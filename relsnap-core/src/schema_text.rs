/*!
Lexical view of schema text.

The schema language itself is owned by the service; this module only splits
schema text into tokens and top-level blocks, which is enough to filter
definitions by prefix and to rename identifiers without compiling anything.
*/

/// Lexical class of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Letters, digits, `_` and `/`, not starting with a digit
    Ident,
    /// Numeric literal
    Number,
    /// Quoted literal, quotes included
    Str,
    /// `// ...` or `/* ... */`
    Comment,
    Whitespace,
    /// Any other single character
    Punct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset of the token in the source
    pub start: usize,
}

impl Token<'_> {
    pub fn is_significant(&self) -> bool {
        !matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }

    pub fn is_ident(&self, text: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == text
    }

    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct && self.text.len() == c.len_utf8() && self.text.starts_with(c)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '/'
}

/// Split schema text into tokens; concatenating the token texts yields the input.
pub fn tokenize(src: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        let kind = if c.is_whitespace() {
            while chars.next_if(|&(_, c)| c.is_whitespace()).is_some() {}
            TokenKind::Whitespace
        } else if is_ident_start(c) {
            while chars.next_if(|&(_, c)| is_ident_continue(c)).is_some() {}
            TokenKind::Ident
        } else if c.is_ascii_digit() {
            while chars
                .next_if(|&(_, c)| c.is_ascii_alphanumeric() || c == '.' || c == '_')
                .is_some()
            {}
            TokenKind::Number
        } else if c == '"' || c == '\'' {
            chars.next();
            let mut escaped = false;
            for (_, next) in chars.by_ref() {
                if escaped {
                    escaped = false;
                } else if next == '\\' {
                    escaped = true;
                } else if next == c {
                    break;
                }
            }
            TokenKind::Str
        } else if src[start..].starts_with("//") {
            while chars.next_if(|&(_, c)| c != '\n').is_some() {}
            TokenKind::Comment
        } else if src[start..].starts_with("/*") {
            chars.next();
            chars.next();
            let mut prev = '\0';
            for (_, next) in chars.by_ref() {
                if prev == '*' && next == '/' {
                    break;
                }
                prev = next;
            }
            TokenKind::Comment
        } else {
            chars.next();
            TokenKind::Punct
        };

        let end = chars.peek().map(|&(i, _)| i).unwrap_or(src.len());
        tokens.push(Token {
            kind,
            text: &src[start..end],
            start,
        });
    }

    tokens
}

/// Kind of a top-level schema block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Definition,
    Caveat,
    /// Any other top-level statement, such as `use expiration`
    Directive,
}

/// A top-level schema item including its leading comments
///
/// `name` is empty for directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block<'a> {
    pub kind: BlockKind,
    pub name: &'a str,
    pub text: &'a str,
}

/// Find the top-level items of a schema, in source order
///
/// Consecutive statements between blocks are returned together as one
/// directive. An unterminated block extends to the end of the input.
pub fn top_level_blocks(src: &str) -> Vec<Block<'_>> {
    let tokens = tokenize(src);
    let mut blocks = Vec::new();
    let mut comment_start: Option<usize> = None;
    let mut directive: Option<(usize, usize)> = None;
    let mut i = 0;

    while i < tokens.len() {
        let token = tokens[i];
        let kind = if token.is_ident("definition") {
            Some(BlockKind::Definition)
        } else if token.is_ident("caveat") {
            Some(BlockKind::Caveat)
        } else {
            None
        };

        let Some(kind) = kind else {
            if token.kind == TokenKind::Comment {
                comment_start.get_or_insert(token.start);
            } else if token.is_significant() {
                let start = comment_start.take().unwrap_or(token.start);
                let span = directive.get_or_insert((start, token.start));
                span.1 = token.start + token.text.len();
            }
            i += 1;
            continue;
        };

        if let Some((start, end)) = directive.take() {
            blocks.push(Block {
                kind: BlockKind::Directive,
                name: "",
                text: &src[start..end],
            });
        }

        let start = comment_start.take().unwrap_or(token.start);
        let name = tokens[i + 1..]
            .iter()
            .find(|t| t.is_significant())
            .filter(|t| t.kind == TokenKind::Ident)
            .map(|t| t.text)
            .unwrap_or("");

        let mut depth = 0usize;
        let mut opened = false;
        let mut end = src.len();
        let mut j = i + 1;
        while j < tokens.len() {
            let t = tokens[j];
            if t.is_punct('{') {
                depth += 1;
                opened = true;
            } else if t.is_punct('}') {
                depth = depth.saturating_sub(1);
                if opened && depth == 0 {
                    end = t.start + t.text.len();
                    break;
                }
            }
            j += 1;
        }

        blocks.push(Block {
            kind,
            name,
            text: &src[start..end],
        });
        i = j + 1;
    }

    if let Some((start, end)) = directive {
        blocks.push(Block {
            kind: BlockKind::Directive,
            name: "",
            text: &src[start..end],
        });
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"// users of the system
definition org/user {}

caveat org/ip_allowed(ip ipaddress, cidr string) {
    ip.in_cidr(cidr) && cidr != "0.0.0.0/0"
}

/** documents */
definition org/document {
    relation viewer: org/user | org/user:* with org/ip_allowed
    permission view = viewer + nil
}
"#;

    #[test]
    fn test_tokens_cover_input() {
        let tokens = tokenize(SCHEMA);
        let rebuilt: String = tokens.iter().map(|t| t.text).collect();
        assert_eq!(rebuilt, SCHEMA);
    }

    #[test]
    fn test_token_classes() {
        let tokens: Vec<Token> = tokenize("relation a: b#c // note\n\"x y\" 42")
            .into_iter()
            .filter(|t| t.is_significant() || t.kind == TokenKind::Comment)
            .collect();
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident,
                TokenKind::Ident,
                TokenKind::Punct,
                TokenKind::Ident,
                TokenKind::Punct,
                TokenKind::Ident,
                TokenKind::Comment,
                TokenKind::Str,
                TokenKind::Number,
            ]
        );
        assert_eq!(tokens[6].text, "// note");
        assert_eq!(tokens[7].text, "\"x y\"");
    }

    #[test]
    fn test_blocks() {
        let blocks = top_level_blocks(SCHEMA);
        assert_eq!(blocks.len(), 3);

        assert_eq!(blocks[0].kind, BlockKind::Definition);
        assert_eq!(blocks[0].name, "org/user");
        assert!(blocks[0].text.starts_with("// users of the system"));

        assert_eq!(blocks[1].kind, BlockKind::Caveat);
        assert_eq!(blocks[1].name, "org/ip_allowed");
        assert!(blocks[1].text.ends_with('}'));

        assert_eq!(blocks[2].name, "org/document");
        assert!(blocks[2].text.starts_with("/** documents */"));
        assert!(blocks[2].text.contains("permission view"));
    }

    #[test]
    fn test_directives_are_kept_as_items() {
        let src = "use expiration\n\n// people\ndefinition user {}\nuse typechecking\n";
        let blocks = top_level_blocks(src);

        let kinds: Vec<BlockKind> = blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![BlockKind::Directive, BlockKind::Definition, BlockKind::Directive]
        );
        assert_eq!(blocks[0].text, "use expiration");
        assert_eq!(blocks[0].name, "");
        assert_eq!(blocks[1].text, "// people\ndefinition user {}");
        assert_eq!(blocks[2].text, "use typechecking");
    }

    #[test]
    fn test_unterminated_block_runs_to_end() {
        let blocks = top_level_blocks("definition a { relation b: c");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].text, "definition a { relation b: c");
    }
}
