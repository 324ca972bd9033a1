//! Known-good scene templates used when submitted source cannot be repaired.

use sha2::{Digest, Sha256};

use crate::scan;

pub const BASIC_SCENE: &str = "BasicScene";
pub const CONTENT_SCENE: &str = "ContentScene";

const MIN_TEXT_CHARS: usize = 5;
const MAX_TEXT_CHARS: usize = 200;
const ACCENTS: &[&str] = &[
    "BLUE", "GREEN", "YELLOW", "PURPLE", "ORANGE", "TEAL", "GOLD", "MAROON",
];

const BASIC_TEMPLATE: &str = r#"from manim import *

class BasicScene(Scene):
    def construct(self):
        title = Text("Animation Demo", font_size=36)
        title.move_to(ORIGIN)
        self.play(Write(title))
        self.wait(1)

        self.play(title.animate.scale(0.8).to_edge(UP))

        subtitle = Text("Created with Manim", font_size=24)
        subtitle.move_to(ORIGIN)
        self.play(FadeIn(subtitle))
        self.wait(1)

        shape = Square(side_length=3)
        shape.move_to(ORIGIN + DOWN)
        shape.set_stroke(BLUE)
        self.play(Create(shape))
        self.wait(1)

        self.play(shape.animate.set_fill(BLUE, opacity=0.5))
        self.wait(2)


if __name__ == '__main__':
    BasicScene().render()
"#;

const CIRCLE_LAYOUT: &str = r#"from manim import *

class ContentScene(Scene):
    def construct(self):
        title = Text("@TITLE@", font_size=36)
        title.scale_to_fit_width(config.frame_width - 2)
        title.move_to(ORIGIN)
        self.play(Write(title))
        self.wait(1)

        self.play(title.animate.scale(0.8).to_edge(UP, buff=1))

        circle = Circle(radius=2, color=@ACCENT@)
        self.play(Create(circle))
        self.wait(1)

        self.play(circle.animate.set_fill(@FILL@, opacity=0.5))
        self.wait(2)


if __name__ == '__main__':
    ContentScene().render()
"#;

const PANEL_LAYOUT: &str = r#"from manim import *

class ContentScene(Scene):
    def construct(self):
        title = Text("@TITLE@", font_size=32)
        title.scale_to_fit_width(config.frame_width - 2)
        title.move_to(ORIGIN)
        self.play(Write(title))
        self.wait(1)

        self.play(title.animate.scale(0.7).to_edge(UP, buff=1))

        rect = Rectangle(height=3, width=5, color=@ACCENT@)
        rect.move_to(ORIGIN)
        caption = Text("Visual Explanation", font_size=24)
        caption.next_to(rect, DOWN, buff=0.5)
        self.play(Create(rect), Write(caption))
        self.wait(1)

        self.play(rect.animate.set_fill(@FILL@, opacity=0.3))
        self.wait(2)


if __name__ == '__main__':
    ContentScene().render()
"#;

const ARROW_LAYOUT: &str = r#"from manim import *

class ContentScene(Scene):
    def construct(self):
        title = Text("@TITLE@", font_size=32)
        title.scale_to_fit_width(config.frame_width - 2)
        title.move_to(ORIGIN)
        self.play(Write(title))
        self.wait(1)

        self.play(title.animate.scale(0.7).to_edge(UP, buff=1))

        start = Text("Start", font_size=24, color=@ACCENT@)
        start.shift(LEFT * 3)
        end = Text("End", font_size=24, color=@FILL@)
        end.shift(RIGHT * 3)
        arrow = Arrow(start.get_right(), end.get_left(), color=WHITE)

        self.play(Write(start))
        self.wait(0.5)
        self.play(Create(arrow))
        self.wait(0.5)
        self.play(Write(end))
        self.wait(2)


if __name__ == '__main__':
    ContentScene().render()
"#;

const LAYOUTS: &[&str] = &[CIRCLE_LAYOUT, PANEL_LAYOUT, ARROW_LAYOUT];

pub struct RenderedTemplate {
    pub source: String,
    pub scene: String,
}

/// First string literal of plausible caption length, whitespace-collapsed.
pub fn extract_text(raw: &str) -> Option<String> {
    scan::scan(raw).literals.into_iter().find_map(|literal| {
        let text = literal.content.split_whitespace().collect::<Vec<_>>().join(" ");
        let chars = text.chars().count();
        (chars > MIN_TEXT_CHARS && chars < MAX_TEXT_CHARS).then_some(text)
    })
}

/// Builds a template around `text`. Layout and colours are picked from the
/// text's digest so the same text always yields the same scene.
pub fn render(text: Option<&str>) -> RenderedTemplate {
    let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
        return RenderedTemplate {
            source: BASIC_TEMPLATE.to_string(),
            scene: BASIC_SCENE.to_string(),
        };
    };

    let digest = Sha256::digest(text.as_bytes());
    let seed = u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    let layout = LAYOUTS[(seed % LAYOUTS.len() as u64) as usize];
    let accent = ACCENTS[(seed % ACCENTS.len() as u64) as usize];
    let fill = ACCENTS[((seed + 3) % ACCENTS.len() as u64) as usize];

    let source = layout
        .replace("@TITLE@", &escape_literal(text))
        .replace("@ACCENT@", accent)
        .replace("@FILL@", fill);

    RenderedTemplate {
        source,
        scene: CONTENT_SCENE.to_string(),
    }
}

fn escape_literal(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' | '\r' | '\t' => escaped.push(' '),
            c if c.is_control() => {}
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::Structure;
    use crate::syntax;

    #[test]
    fn every_layout_is_renderable() {
        for source in [BASIC_TEMPLATE, CIRCLE_LAYOUT, PANEL_LAYOUT, ARROW_LAYOUT] {
            let structure = Structure::inspect(source);
            assert!(structure.is_renderable());
            assert!(structure.has_main_guard);
            assert_eq!(syntax::check(source), Ok(()));
        }
    }

    #[test]
    fn extraction_skips_short_literals() {
        let raw = "a = 'hi'\nb = \"  Pythagorean   theorem \"\n";
        assert_eq!(extract_text(raw).as_deref(), Some("Pythagorean theorem"));
        assert_eq!(extract_text("x = 'tiny'"), None);
        assert_eq!(extract_text(&format!("x = '{}'", "y".repeat(300))), None);
    }

    #[test]
    fn quotes_in_text_are_escaped() {
        let rendered = render(Some(r#"say "hi" \o/"#));
        assert!(rendered.source.contains(r#"Text("say \"hi\" \\o/""#));
        assert_eq!(syntax::check(&rendered.source), Ok(()));
        assert_eq!(rendered.scene, CONTENT_SCENE);
    }

    #[test]
    fn same_text_same_template() {
        let a = render(Some("Eigenvectors explained"));
        let b = render(Some("Eigenvectors explained"));
        assert_eq!(a.source, b.source);
        assert_eq!(render(None).scene, BASIC_SCENE);
    }
}
