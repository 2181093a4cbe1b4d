use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    Pull,
    Push,
    ShowDiff,
    Ignore,
    ToggleLogs,
    CloseView,
    ToggleHelp,
    Down,
    Up,
    PageDown,
    PageUp,
    Top,
    Bottom,
}

pub fn map_key(key: KeyEvent) -> Option<Action> {
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return match key.code {
            KeyCode::Char('c') => Some(Action::Quit),
            KeyCode::Char('d') => Some(Action::PageDown),
            KeyCode::Char('u') => Some(Action::PageUp),
            _ => None,
        };
    }

    match key.code {
        KeyCode::Char('q') => Some(Action::Quit),
        KeyCode::Char('p') => Some(Action::Pull),
        KeyCode::Char('u') => Some(Action::Push),
        KeyCode::Char('d') => Some(Action::ShowDiff),
        KeyCode::Char('i') => Some(Action::Ignore),
        KeyCode::Char('l') => Some(Action::ToggleLogs),
        KeyCode::Esc => Some(Action::CloseView),
        KeyCode::Char('?') => Some(Action::ToggleHelp),
        KeyCode::Char('j') | KeyCode::Down => Some(Action::Down),
        KeyCode::Char('k') | KeyCode::Up => Some(Action::Up),
        KeyCode::PageDown => Some(Action::PageDown),
        KeyCode::PageUp => Some(Action::PageUp),
        KeyCode::Char('g') | KeyCode::Home => Some(Action::Top),
        KeyCode::Char('G') | KeyCode::End => Some(Action::Bottom),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, map_key};
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn notification_keys_map_to_actions() {
        assert_eq!(map_key(press(KeyCode::Char('p'))), Some(Action::Pull));
        assert_eq!(map_key(press(KeyCode::Char('u'))), Some(Action::Push));
        assert_eq!(map_key(press(KeyCode::Char('d'))), Some(Action::ShowDiff));
        assert_eq!(map_key(press(KeyCode::Char('i'))), Some(Action::Ignore));
        assert_eq!(map_key(press(KeyCode::Esc)), Some(Action::CloseView));
        assert_eq!(map_key(press(KeyCode::Char('x'))), None);
    }

    #[test]
    fn control_chords_do_not_trigger_plain_actions() {
        let ctrl = |c| KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL);
        assert_eq!(map_key(ctrl('u')), Some(Action::PageUp));
        assert_eq!(map_key(ctrl('d')), Some(Action::PageDown));
        assert_eq!(map_key(ctrl('c')), Some(Action::Quit));
        assert_eq!(map_key(ctrl('p')), None);
    }
}
