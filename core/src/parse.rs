//! Parser for Basecode source text. Consumes a [SourceFile] and produces the
//! raw [AstNode] tree consumed by the AST evaluator. The grammar is
//! statement-oriented: declarations (`x: u32 := 10;`, `N :: expr;`),
//! composite types, procedures, control flow, directives (`#name`), and
//! attributes (`@name`), all terminated by `;` except comments.

use crate::{
    ast::{AstNode, AstNodeKind, Token},
    error::{Diagnostic, Severity},
    source::{SourceFile, SourceLocation, SourcePosition},
};
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_until, take_while, take_while1},
    character::complete::{char, digit1, hex_digit1, multispace0},
    combinator::{all_consuming, map, not, opt, peek, recognize, verify},
    error::{context, VerboseError, VerboseErrorKind},
    multi::{many0, many1, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use nom_locate::LocatedSpan;

type RawSpan<'a> = LocatedSpan<&'a str>;
type ParseResult<'a, T> = IResult<RawSpan<'a>, T, VerboseError<RawSpan<'a>>>;

/// Words that can never be identifiers.
const KEYWORDS: &[&str] = &[
    "if", "else", "while", "proc", "struct", "union", "enum", "namespace",
    "cast", "transmute", "alias", "module", "import", "return", "true",
    "false", "null", "from",
];

/// Parse an entire source file into a `Module` AST node. Any syntax error is
/// reported as a single coded diagnostic pointing at the failure position.
pub fn parse_module(file: &SourceFile) -> Result<AstNode, Diagnostic> {
    let input = RawSpan::new(file.source());
    match all_consuming(terminated(module, sp))(input) {
        Ok((_, node)) => Ok(node),
        Err(nom::Err::Error(err)) | Err(nom::Err::Failure(err)) => {
            Err(syntax_diagnostic(&err))
        }
        Err(nom::Err::Incomplete(_)) => {
            unreachable!("only complete parsers are used")
        }
    }
}

/// Convert a nom error stack into a `P001` diagnostic. The deepest context
/// label names what was expected at the failure point.
fn syntax_diagnostic(error: &VerboseError<RawSpan>) -> Diagnostic {
    let expected = error
        .errors
        .iter()
        .find_map(|(_, kind)| match kind {
            VerboseErrorKind::Context(label) => Some(*label),
            _ => None,
        })
        .unwrap_or("statement");
    let location = error
        .errors
        .first()
        .map(|(span, _)| single_position(span))
        .unwrap_or_default();
    Diagnostic::new(
        "P001",
        format!("syntax error: expected {}", expected),
        Severity::Error,
        location,
    )
}

fn position_of(span: &RawSpan) -> SourcePosition {
    SourcePosition {
        line: span.location_line() as usize,
        column: span.get_utf8_column(),
    }
}

fn single_position(span: &RawSpan) -> SourceLocation {
    let position = position_of(span);
    SourceLocation {
        start: position,
        end: position,
    }
}

/// Run `inner` and capture the source span it consumed.
fn located<'a, T>(
    mut inner: impl FnMut(RawSpan<'a>) -> ParseResult<'a, T>,
) -> impl FnMut(RawSpan<'a>) -> ParseResult<'a, (T, SourceLocation)> {
    move |input| {
        let (input, _) = sp(input)?;
        let start = position_of(&input);
        let (rest, value) = inner(input)?;
        let end = position_of(&rest);
        Ok((rest, (value, SourceLocation { start, end })))
    }
}

/// Skip spaces, tabs, and newlines. Comments are statements, not trivia, so
/// they are not skipped here.
fn sp(input: RawSpan) -> ParseResult<()> {
    map(multispace0, |_| ())(input)
}

/// A fixed operator/punctuation token, with leading whitespace skipped.
fn sym<'a>(
    token: &'static str,
) -> impl FnMut(RawSpan<'a>) -> ParseResult<'a, RawSpan<'a>> {
    preceded(sp, tag(token))
}

/// A keyword: the exact word, not followed by an identifier character.
fn kw<'a>(
    word: &'static str,
) -> impl FnMut(RawSpan<'a>) -> ParseResult<'a, RawSpan<'a>> {
    preceded(sp, terminated(tag(word), peek(not(take_while1(is_ident_char)))))
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

/// An identifier that is not a keyword.
fn identifier(input: RawSpan) -> ParseResult<String> {
    let (rest, name) = preceded(
        sp,
        verify(
            recognize(pair(
                take_while1(is_ident_start),
                take_while(is_ident_char),
            )),
            |name: &RawSpan| !KEYWORDS.contains(name.fragment()),
        ),
    )(input)?;
    Ok((rest, name.fragment().to_string()))
}

// ------------------------------------------------------------------------
// module & statements

fn module(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (statements, location)) = located(many0(statement))(input)?;
    let mut node = AstNode::new(AstNodeKind::Module, location);
    node.children = statements;
    Ok((rest, node))
}

fn statement(input: RawSpan) -> ParseResult<AstNode> {
    preceded(
        sp,
        alt((
            line_comment,
            block_comment,
            directive_statement,
            attribute_statement,
            plain_statement,
            labeled_statement,
        )),
    )(input)
}

fn line_comment(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (text, location)) =
        located(preceded(tag("//"), opt(is_not("\n"))))(input)?;
    let value = text.map(|s| s.fragment().trim().to_string()).unwrap_or_default();
    let node = AstNode::with_token(
        AstNodeKind::LineComment,
        Token::new(value),
        location,
    );
    Ok((rest, node))
}

fn block_comment(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (text, location)) = located(delimited(
        tag("/*"),
        take_until("*/"),
        tag("*/"),
    ))(input)?;
    let node = AstNode::with_token(
        AstNodeKind::BlockComment,
        Token::new(text.fragment().trim().to_string()),
        location,
    );
    Ok((rest, node))
}

/// `#name attr="value"… expr ;`
fn directive_statement(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, ((name, attributes, expression), location)) =
        located(tuple((
            preceded(char('#'), identifier),
            many0(directive_attribute),
            opt(statement_expression),
        )))(input)?;
    let (rest, _) = context("';'", sym(";"))(rest)?;
    let mut node = AstNode::with_token(
        AstNodeKind::Directive,
        Token::new(name),
        location,
    );
    node.children = attributes;
    node.lhs = expression.map(Box::new);
    Ok((rest, node))
}

/// `name="literal"` — only permitted between a directive name and its
/// expression.
fn directive_attribute(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, ((name, value), location)) = located(tuple((
        identifier,
        preceded(sym("="), alt((string_literal, number_literal, boolean_literal))),
    )))(input)?;
    let mut node = AstNode::with_token(
        AstNodeKind::Attribute,
        Token::new(name),
        location,
    );
    node.lhs = Some(Box::new(value));
    Ok((rest, node))
}

/// `@name expr ;`
fn attribute_statement(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, ((name, expression), location)) = located(tuple((
        preceded(char('@'), identifier),
        opt(expression),
    )))(input)?;
    let (rest, _) = context("';'", sym(";"))(rest)?;
    let mut node = AstNode::with_token(
        AstNodeKind::Attribute,
        Token::new(name),
        location,
    );
    node.lhs = expression.map(Box::new);
    Ok((rest, node))
}

fn plain_statement(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (expression, location)) =
        located(statement_expression)(input)?;
    let (rest, _) = context("';'", sym(";"))(rest)?;
    let mut node = AstNode::new(AstNodeKind::Statement, location);
    node.rhs = Some(Box::new(expression));
    Ok((rest, node))
}

/// `label: label2: expr ;` — tried after [plain_statement] so that typed
/// declarations (`x: u32 := …`) are never mistaken for labels.
fn labeled_statement(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, ((labels, expression), location)) = located(tuple((
        many1(label_declaration),
        statement_expression,
    )))(input)?;
    let (rest, _) = context("';'", sym(";"))(rest)?;

    let mut label_list = AstNode::new(AstNodeKind::LabelList, location);
    label_list.children = labels;

    let mut node = AstNode::new(AstNodeKind::Statement, location);
    node.lhs = Some(Box::new(label_list));
    node.rhs = Some(Box::new(expression));
    Ok((rest, node))
}

fn label_declaration(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (name, location)) = located(terminated(
        identifier,
        // a label's colon must not begin `::` or `:=`
        terminated(sym(":"), peek(not(alt((char(':'), char('=')))))),
    ))(input)?;
    Ok((
        rest,
        AstNode::with_token(AstNodeKind::Label, Token::new(name), location),
    ))
}

/// Everything that may follow labels in a statement: an assignment, a
/// declaration without an initializer (`x: u32`), or a bare expression.
fn statement_expression(input: RawSpan) -> ParseResult<AstNode> {
    alt((assignment, annotated_declaration, expression))(input)
}

fn annotated_declaration(input: RawSpan) -> ParseResult<AstNode> {
    verify(target_symbol, |symbol: &AstNode| {
        symbol.type_annotation().is_some()
    })(input)
}

// ------------------------------------------------------------------------
// assignment & symbols

/// `targets := sources` or `targets :: sources` (constant declaration).
fn assignment(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, ((targets, operator, sources), location)) =
        located(tuple((
            separated_list1(sym(","), target_symbol),
            alt((sym(":="), constant_operator)),
            separated_list1(sym(","), expression),
        )))(input)?;

    let constant = *operator.fragment() == "::";

    let mut target_list = AstNode::new(AstNodeKind::TargetList, location);
    target_list.children = targets;
    for target in &mut target_list.children {
        target.is_constant = constant;
    }

    let mut source_list = AstNode::new(AstNodeKind::SourceList, location);
    source_list.children = sources;

    let mut node = AstNode::new(AstNodeKind::Assignment, location);
    node.is_constant = constant;
    node.lhs = Some(Box::new(target_list));
    node.rhs = Some(Box::new(source_list));
    Ok((rest, node))
}

/// The `::` of a constant declaration. A tight `::` between identifiers is
/// namespace qualification (`math::pi`), so the constant operator requires
/// whitespace on at least one side.
fn constant_operator(input: RawSpan) -> ParseResult<RawSpan> {
    let (rest, leading) = multispace0(input)?;
    let (rest, op) = tag("::")(rest)?;
    if leading.fragment().is_empty() {
        let _ = peek(nom::character::complete::multispace1)(rest)?;
    }
    Ok((rest, op))
}

/// A declaration target: a (possibly qualified) symbol with an optional type
/// annotation. Qualification stops before a segment that opens a call, so
/// that `N :: size_of(u64)` keeps `N` as the target.
fn target_symbol(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, ((first, others, annotation), location)) =
        located(tuple((
            identifier,
            many0(terminated(
                preceded(tag("::"), identifier),
                peek(not(sym("("))),
            )),
            opt(type_annotation),
        )))(input)?;
    Ok((rest, build_symbol(first, others, annotation, location)))
}

/// A symbol in expression position: fully greedy qualification.
fn qualified_symbol(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, ((first, others), location)) = located(pair(
        identifier,
        many0(preceded(tag("::"), identifier)),
    ))(input)?;
    Ok((rest, build_symbol(first, others, None, location)))
}

fn build_symbol(
    first: String,
    others: Vec<String>,
    annotation: Option<AstNode>,
    location: SourceLocation,
) -> AstNode {
    let mut node = AstNode::new(AstNodeKind::Symbol, location);
    node.children.push(AstNode::with_token(
        AstNodeKind::SymbolPart,
        Token::new(first),
        location,
    ));
    for name in others {
        node.children.push(AstNode::with_token(
            AstNodeKind::SymbolPart,
            Token::new(name),
            location,
        ));
    }
    node.rhs = annotation.map(Box::new);
    node
}

/// `: type`, `: *type`, or `: type[size]`. The colon must not begin `::` or
/// `:=`.
fn type_annotation(input: RawSpan) -> ParseResult<AstNode> {
    let (input, _) =
        terminated(sym(":"), peek(not(alt((char(':'), char('='))))))(input)?;
    let (rest, ((pointer, name, array), location)) = located(tuple((
        opt(sym("*")),
        identifier,
        opt(delimited(sym("["), opt(preceded(sp, digit1)), sym("]"))),
    )))(input)?;
    let mut node = AstNode::with_token(
        AstNodeKind::TypeIdentifier,
        Token::new(name),
        location,
    );
    node.is_pointer = pointer.is_some();
    if let Some(size) = array {
        node.is_array = true;
        node.array_size = size
            .map(|digits| digits.fragment().parse::<usize>().unwrap_or(0))
            .unwrap_or(0);
    }
    Ok((rest, node))
}

// ------------------------------------------------------------------------
// expressions

pub(crate) fn expression(input: RawSpan) -> ParseResult<AstNode> {
    logical_or(input)
}

/// Left-associative binary operator level helper.
fn binary_level<'a>(
    mut operand: impl FnMut(RawSpan<'a>) -> ParseResult<'a, AstNode>,
    mut operator: impl FnMut(RawSpan<'a>) -> ParseResult<'a, RawSpan<'a>>,
) -> impl FnMut(RawSpan<'a>) -> ParseResult<'a, AstNode> {
    move |input| {
        let (mut rest, mut lhs) = operand(input)?;
        while let Ok((after_op, op)) = operator(rest) {
            let (after_rhs, rhs) = operand(after_op)?;
            rest = after_rhs;
            let location = SourceLocation {
                start: lhs.location.start,
                end: rhs.location.end,
            };
            let mut node = AstNode::with_token(
                AstNodeKind::BinaryOperator,
                Token::new(op.fragment().to_string()),
                location,
            );
            node.lhs = Some(Box::new(lhs));
            node.rhs = Some(Box::new(rhs));
            lhs = node;
        }
        Ok((rest, lhs))
    }
}

fn logical_or(input: RawSpan) -> ParseResult<AstNode> {
    binary_level(logical_and, sym("||"))(input)
}

fn logical_and(input: RawSpan) -> ParseResult<AstNode> {
    binary_level(bitwise_or, sym("&&"))(input)
}

fn bitwise_or(input: RawSpan) -> ParseResult<AstNode> {
    binary_level(
        bitwise_xor,
        terminated(sym("|"), peek(not(char('|')))),
    )(input)
}

fn bitwise_xor(input: RawSpan) -> ParseResult<AstNode> {
    binary_level(bitwise_and, sym("^"))(input)
}

fn bitwise_and(input: RawSpan) -> ParseResult<AstNode> {
    binary_level(
        equality,
        terminated(sym("&"), peek(not(char('&')))),
    )(input)
}

fn equality(input: RawSpan) -> ParseResult<AstNode> {
    binary_level(relational, alt((sym("=="), sym("!="))))(input)
}

fn relational(input: RawSpan) -> ParseResult<AstNode> {
    binary_level(
        shift,
        alt((
            sym("<="),
            sym(">="),
            terminated(sym("<"), peek(not(char('<')))),
            terminated(sym(">"), peek(not(char('>')))),
        )),
    )(input)
}

fn shift(input: RawSpan) -> ParseResult<AstNode> {
    binary_level(
        additive,
        alt((sym("<<<"), sym(">>>"), sym("<<"), sym(">>"))),
    )(input)
}

fn additive(input: RawSpan) -> ParseResult<AstNode> {
    binary_level(multiplicative, alt((sym("+"), sym("-"))))(input)
}

fn multiplicative(input: RawSpan) -> ParseResult<AstNode> {
    binary_level(unary, alt((sym("*"), sym("/"), sym("%"))))(input)
}

fn unary(input: RawSpan) -> ParseResult<AstNode> {
    alt((prefix_operator, postfix))(input)
}

fn prefix_operator(input: RawSpan) -> ParseResult<AstNode> {
    // a '-' directly attached to a number literal is part of the literal
    let (rest, ((op, rhs), location)) = located(pair(
        alt((
            terminated(sym("-"), peek(not(digit1))),
            sym("~"),
            sym("!"),
        )),
        unary,
    ))(input)?;
    let mut node = AstNode::with_token(
        AstNodeKind::UnaryOperator,
        Token::new(op.fragment().to_string()),
        location,
    );
    node.rhs = Some(Box::new(rhs));
    Ok((rest, node))
}

fn postfix(input: RawSpan) -> ParseResult<AstNode> {
    preceded(
        sp,
        alt((
            parenthesized,
            number_literal,
            string_literal,
            boolean_literal,
            null_literal,
            if_expression,
            while_expression,
            proc_expression,
            struct_expression,
            union_expression,
            enum_expression,
            namespace_expression,
            cast_expression,
            transmute_expression,
            alias_expression,
            module_expression,
            import_expression,
            return_statement,
            call_or_symbol,
        )),
    )(input)
}

fn parenthesized(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (inner, location)) = located(delimited(
        sym("("),
        expression,
        context("')'", sym(")")),
    ))(input)?;
    let mut node = AstNode::new(AstNodeKind::Expression, location);
    node.lhs = Some(Box::new(inner));
    Ok((rest, node))
}

/// A qualified symbol, optionally called: `puts("x")`, `math::pi`.
fn call_or_symbol(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, symbol) = qualified_symbol(input)?;
    match argument_list(rest) {
        Ok((rest, arguments)) => {
            let location = SourceLocation {
                start: symbol.location.start,
                end: arguments.location.end,
            };
            let mut node = AstNode::new(AstNodeKind::ProcCall, location);
            node.lhs = Some(Box::new(symbol));
            node.rhs = Some(Box::new(arguments));
            Ok((rest, node))
        }
        Err(_) => Ok((rest, symbol)),
    }
}

fn argument_list(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (arguments, location)) = located(delimited(
        sym("("),
        separated_list0(sym(","), expression),
        context("')'", sym(")")),
    ))(input)?;
    let mut node = AstNode::new(AstNodeKind::ArgumentList, location);
    node.children = arguments;
    Ok((rest, node))
}

// ------------------------------------------------------------------------
// literals

fn number_literal(input: RawSpan) -> ParseResult<AstNode> {
    alt((hex_literal, float_literal, integer_literal))(input)
}

fn hex_literal(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (digits, location)) =
        located(preceded(char('$'), hex_digit1))(input)?;
    let token = Token::integer(digits.fragment().to_string(), 16, false);
    Ok((
        rest,
        AstNode::with_token(AstNodeKind::NumberLiteral, token, location),
    ))
}

fn float_literal(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (text, location)) = located(recognize(tuple((
        opt(char('-')),
        digit1,
        char('.'),
        digit1,
    ))))(input)?;
    let signed = text.fragment().starts_with('-');
    let token = Token::floating_point(text.fragment().to_string(), signed);
    Ok((
        rest,
        AstNode::with_token(AstNodeKind::NumberLiteral, token, location),
    ))
}

fn integer_literal(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (text, location)) =
        located(recognize(pair(opt(char('-')), digit1)))(input)?;
    let signed = text.fragment().starts_with('-');
    let token = Token::integer(text.fragment().to_string(), 10, signed);
    Ok((
        rest,
        AstNode::with_token(AstNodeKind::NumberLiteral, token, location),
    ))
}

fn string_literal(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, ((_, pieces, _), location)) = located(tuple((
        char('"'),
        many0(string_piece),
        context("closing '\"'", char('"')),
    )))(input)?;
    let token = Token::new(pieces.concat());
    Ok((
        rest,
        AstNode::with_token(AstNodeKind::StringLiteral, token, location),
    ))
}

fn string_piece(input: RawSpan) -> ParseResult<String> {
    alt((
        map(preceded(char('\\'), nom::character::complete::anychar), |c| {
            match c {
                'n' => "\n".to_string(),
                't' => "\t".to_string(),
                'r' => "\r".to_string(),
                '0' => "\0".to_string(),
                other => other.to_string(),
            }
        }),
        map(is_not("\"\\"), |s: RawSpan| s.fragment().to_string()),
    ))(input)
}

fn boolean_literal(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (value, location)) =
        located(alt((kw("true"), kw("false"))))(input)?;
    let token = Token::new(value.fragment().to_string());
    Ok((
        rest,
        AstNode::with_token(AstNodeKind::BooleanLiteral, token, location),
    ))
}

fn null_literal(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (_, location)) = located(kw("null"))(input)?;
    Ok((rest, AstNode::new(AstNodeKind::NullLiteral, location)))
}

// ------------------------------------------------------------------------
// blocks & compound expressions

fn basic_block(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (statements, location)) = located(delimited(
        sym("{"),
        many0(statement),
        context("'}'", sym("}")),
    ))(input)?;
    let mut node = AstNode::new(AstNodeKind::BasicBlock, location);
    node.children = statements;
    Ok((rest, node))
}

fn if_expression(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, ((predicate, true_branch, false_branch), location)) =
        located(tuple((
            preceded(kw("if"), expression),
            context("block", basic_block),
            opt(else_clause),
        )))(input)?;
    let mut node = AstNode::new(AstNodeKind::IfExpression, location);
    node.lhs = Some(Box::new(predicate));
    node.children.push(true_branch);
    node.rhs = false_branch.map(Box::new);
    Ok((rest, node))
}

fn else_clause(input: RawSpan) -> ParseResult<AstNode> {
    preceded(kw("else"), alt((else_if_expression, else_expression)))(input)
}

fn else_if_expression(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, ((predicate, true_branch, false_branch), location)) =
        located(tuple((
            preceded(kw("if"), expression),
            context("block", basic_block),
            opt(else_clause),
        )))(input)?;
    let mut node = AstNode::new(AstNodeKind::ElseIfExpression, location);
    node.lhs = Some(Box::new(predicate));
    node.children.push(true_branch);
    node.rhs = false_branch.map(Box::new);
    Ok((rest, node))
}

fn else_expression(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (block, location)) =
        located(context("block", basic_block))(input)?;
    let mut node = AstNode::new(AstNodeKind::ElseExpression, location);
    node.children.push(block);
    Ok((rest, node))
}

fn while_expression(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, ((predicate, body), location)) = located(tuple((
        preceded(kw("while"), expression),
        context("block", basic_block),
    )))(input)?;
    let mut node = AstNode::new(AstNodeKind::WhileExpression, location);
    node.lhs = Some(Box::new(predicate));
    node.children.push(body);
    Ok((rest, node))
}

/// `proc(params) -> r0, r1 { body }` — returns and body optional.
fn proc_expression(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, ((parameters, returns, body), location)) =
        located(tuple((
            preceded(
                kw("proc"),
                delimited(
                    context("'('", sym("(")),
                    separated_list0(sym(","), parameter),
                    context("')'", sym(")")),
                ),
            ),
            opt(preceded(
                sym("->"),
                separated_list1(sym(","), qualified_symbol),
            )),
            opt(basic_block),
        )))(input)?;

    let mut type_list = AstNode::new(AstNodeKind::TypeList, location);
    type_list.children = returns.unwrap_or_default();

    let mut parameter_list = AstNode::new(AstNodeKind::ParameterList, location);
    parameter_list.children = parameters;

    let mut node = AstNode::new(AstNodeKind::ProcExpression, location);
    node.lhs = Some(Box::new(type_list));
    node.rhs = Some(Box::new(parameter_list));
    if let Some(body) = body {
        node.children.push(body);
    }
    Ok((rest, node))
}

/// One procedure parameter: `name: type`, `name := default`, or a bare
/// name.
fn parameter(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, symbol) = target_symbol(input)?;
    match preceded(sym(":="), expression)(rest) {
        Ok((rest, default)) => {
            let location = SourceLocation {
                start: symbol.location.start,
                end: default.location.end,
            };

            let mut target_list =
                AstNode::new(AstNodeKind::TargetList, location);
            target_list.children.push(symbol);

            let mut source_list =
                AstNode::new(AstNodeKind::SourceList, location);
            source_list.children.push(default);

            let mut node = AstNode::new(AstNodeKind::Assignment, location);
            node.lhs = Some(Box::new(target_list));
            node.rhs = Some(Box::new(source_list));
            Ok((rest, node))
        }
        Err(_) => Ok((rest, symbol)),
    }
}

fn composite_expression<'a>(
    word: &'static str,
    kind: AstNodeKind,
) -> impl FnMut(RawSpan<'a>) -> ParseResult<'a, AstNode> {
    move |input| {
        let (rest, (block, location)) =
            located(preceded(kw(word), context("block", basic_block)))(input)?;
        let mut node = AstNode::new(kind, location);
        node.rhs = Some(Box::new(block));
        Ok((rest, node))
    }
}

fn struct_expression(input: RawSpan) -> ParseResult<AstNode> {
    composite_expression("struct", AstNodeKind::StructExpression)(input)
}

fn union_expression(input: RawSpan) -> ParseResult<AstNode> {
    composite_expression("union", AstNodeKind::UnionExpression)(input)
}

fn enum_expression(input: RawSpan) -> ParseResult<AstNode> {
    composite_expression("enum", AstNodeKind::EnumExpression)(input)
}

fn namespace_expression(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (block, location)) = located(preceded(
        kw("namespace"),
        context("block", basic_block),
    ))(input)?;
    let mut node = AstNode::new(AstNodeKind::NamespaceExpression, location);
    node.rhs = Some(Box::new(block));
    Ok((rest, node))
}

fn cast_like<'a>(
    word: &'static str,
    kind: AstNodeKind,
) -> impl FnMut(RawSpan<'a>) -> ParseResult<'a, AstNode> {
    move |input| {
        let (rest, ((type_name, expr), location)) = located(tuple((
            preceded(
                kw(word),
                delimited(
                    context("'<'", sym("<")),
                    identifier,
                    context("'>'", sym(">")),
                ),
            ),
            delimited(
                context("'('", sym("(")),
                expression,
                context("')'", sym(")")),
            ),
        )))(input)?;
        let mut node = AstNode::new(kind, location);
        node.lhs = Some(Box::new(AstNode::with_token(
            AstNodeKind::TypeIdentifier,
            Token::new(type_name),
            location,
        )));
        node.rhs = Some(Box::new(expr));
        Ok((rest, node))
    }
}

fn cast_expression(input: RawSpan) -> ParseResult<AstNode> {
    cast_like("cast", AstNodeKind::CastExpression)(input)
}

fn transmute_expression(input: RawSpan) -> ParseResult<AstNode> {
    cast_like("transmute", AstNodeKind::TransmuteExpression)(input)
}

fn alias_expression(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (expr, location)) = located(preceded(
        kw("alias"),
        delimited(
            context("'('", sym("(")),
            expression,
            context("')'", sym(")")),
        ),
    ))(input)?;
    let mut node = AstNode::new(AstNodeKind::AliasExpression, location);
    node.lhs = Some(Box::new(expr));
    Ok((rest, node))
}

fn module_expression(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (expr, location)) = located(preceded(
        kw("module"),
        delimited(
            context("'('", sym("(")),
            expression,
            context("')'", sym(")")),
        ),
    ))(input)?;
    let mut node = AstNode::new(AstNodeKind::ModuleExpression, location);
    node.rhs = Some(Box::new(expr));
    Ok((rest, node))
}

fn import_expression(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, ((symbol, from), location)) = located(tuple((
        preceded(kw("import"), qualified_symbol),
        opt(preceded(kw("from"), qualified_symbol)),
    )))(input)?;
    let mut node = AstNode::new(AstNodeKind::ImportExpression, location);
    node.lhs = Some(Box::new(symbol));
    node.rhs = from.map(Box::new);
    Ok((rest, node))
}

fn return_statement(input: RawSpan) -> ParseResult<AstNode> {
    let (rest, (expressions, location)) = located(preceded(
        kw("return"),
        separated_list0(sym(","), expression),
    ))(input)?;
    let mut list = AstNode::new(AstNodeKind::ArgumentList, location);
    list.children = expressions;
    let mut node = AstNode::new(AstNodeKind::ReturnStatement, location);
    node.rhs = Some(Box::new(list));
    Ok((rest, node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn parse(source: &str) -> AstNode {
        let file = SourceFile::from_source(
            PathBuf::from("test.bc"),
            source.to_string(),
        );
        parse_module(&file).unwrap()
    }

    #[test]
    fn test_typed_declaration() {
        let module = parse("x: u32 := 10;");
        assert_eq!(module.children.len(), 1);
        let statement = &module.children[0];
        assert_eq!(statement.kind, AstNodeKind::Statement);
        let assignment = statement.rhs.as_ref().unwrap();
        assert_eq!(assignment.kind, AstNodeKind::Assignment);
        let target = &assignment.lhs.as_ref().unwrap().children[0];
        assert_eq!(target.kind, AstNodeKind::Symbol);
        assert_eq!(target.children[0].token.value, "x");
        let annotation = target.type_annotation().unwrap();
        assert_eq!(annotation.token.value, "u32");
    }

    #[test]
    fn test_constant_declaration_keeps_call_on_rhs() {
        let module = parse("N :: size_of(u64);");
        let assignment =
            module.children[0].rhs.as_ref().unwrap().clone();
        assert!(assignment.is_constant);
        let target = &assignment.lhs.as_ref().unwrap().children[0];
        assert_eq!(target.children.len(), 1);
        assert_eq!(target.children[0].token.value, "N");
        let source = &assignment.rhs.as_ref().unwrap().children[0];
        assert_eq!(source.kind, AstNodeKind::ProcCall);
    }

    #[test]
    fn test_qualified_symbol_in_expression() {
        let module = parse("r := math::pi * 2.0;");
        let assignment = module.children[0].rhs.as_ref().unwrap();
        let source = &assignment.rhs.as_ref().unwrap().children[0];
        assert_eq!(source.kind, AstNodeKind::BinaryOperator);
        assert_eq!(source.token.value, "*");
        let lhs = source.lhs.as_ref().unwrap();
        assert!(lhs.is_qualified_symbol());
        assert_eq!(lhs.children[0].token.value, "math");
        assert_eq!(lhs.children[1].token.value, "pi");
    }

    #[test]
    fn test_struct_expression() {
        let module = parse("Point :: struct { x := 0; y := 0; };");
        let assignment = module.children[0].rhs.as_ref().unwrap();
        let source = &assignment.rhs.as_ref().unwrap().children[0];
        assert_eq!(source.kind, AstNodeKind::StructExpression);
        let block = source.rhs.as_ref().unwrap();
        assert_eq!(block.children.len(), 2);
    }

    #[test]
    fn test_directive_with_attributes() {
        let module = parse(
            "#foreign library=\"libc\" alias=\"puts\" \
             puts :: proc(s: address) -> s32;",
        );
        let directive = &module.children[0];
        assert_eq!(directive.kind, AstNodeKind::Directive);
        assert_eq!(directive.token.value, "foreign");
        assert_eq!(directive.children.len(), 2);
        assert_eq!(directive.children[0].token.value, "library");
        let assignment = directive.lhs.as_ref().unwrap();
        assert_eq!(assignment.kind, AstNodeKind::Assignment);
        let source = &assignment.rhs.as_ref().unwrap().children[0];
        assert_eq!(source.kind, AstNodeKind::ProcExpression);
        let params = source.rhs.as_ref().unwrap();
        assert_eq!(params.children.len(), 1);
        let returns = source.lhs.as_ref().unwrap();
        assert_eq!(returns.children[0].children[0].token.value, "s32");
    }

    #[test]
    fn test_signed_literal() {
        let module = parse("x := -5;");
        let assignment = module.children[0].rhs.as_ref().unwrap();
        let source = &assignment.rhs.as_ref().unwrap().children[0];
        assert_eq!(source.kind, AstNodeKind::NumberLiteral);
        assert!(source.token.is_signed());
        assert_eq!(source.token.parse_integer().unwrap(), 5);
    }

    #[test]
    fn test_labeled_statement_and_while() {
        let module = parse("top: while x > 0 { x := x - 1; };");
        let statement = &module.children[0];
        let labels = statement.lhs.as_ref().unwrap();
        assert_eq!(labels.children[0].token.value, "top");
        let body = statement.rhs.as_ref().unwrap();
        assert_eq!(body.kind, AstNodeKind::WhileExpression);
    }

    #[test]
    fn test_comments_are_statements() {
        let module = parse("// leading note\nx := 1; /* trailing */");
        assert_eq!(module.children[0].kind, AstNodeKind::LineComment);
        assert_eq!(module.children[0].token.value, "leading note");
        assert_eq!(module.children[2].kind, AstNodeKind::BlockComment);
    }

    #[test]
    fn test_syntax_error_reports_position() {
        let file = SourceFile::from_source(
            PathBuf::from("test.bc"),
            "x := ;".to_string(),
        );
        let error = parse_module(&file).unwrap_err();
        assert_eq!(error.code(), "P001");
    }
}
