use crate::app::InputMode;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Quit,
    Down,
    Up,
    Top,
    Bottom,
    ExpandOrCollapse,
    Expand,
    Collapse,
    ClearSelection,
    Refresh,
    RefreshAll,
    ReloadProjects,
    StartAddProject,
    UnloadProject,
    OpenConsole,
    ConfigureAccess,
    Connect,
    Disconnect,
    StartFilter,
    ToggleWindows,
    ToggleLinux,
    ToggleHelp,
    ConfirmYes,
    ConfirmNo,
    SubmitInput,
    CancelInput,
    Backspace,
    InputChar(char),
}

pub fn map_key(mode: InputMode, key: KeyEvent) -> Option<Action> {
    match mode {
        InputMode::Normal => map_normal_mode_key(key),
        InputMode::AddProject | InputMode::Filter => map_input_mode_key(key),
    }
}

fn map_normal_mode_key(key: KeyEvent) -> Option<Action> {
    match key.code {
        KeyCode::Char('q') => Some(Action::Quit),
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Action::Quit),
        KeyCode::Char('j') if key.modifiers.is_empty() => Some(Action::Down),
        KeyCode::Down => Some(Action::Down),
        KeyCode::Char('k') if key.modifiers.is_empty() => Some(Action::Up),
        KeyCode::Up => Some(Action::Up),
        KeyCode::Home => Some(Action::Top),
        KeyCode::End => Some(Action::Bottom),
        KeyCode::Char('G') => Some(Action::Bottom),
        KeyCode::Enter => Some(Action::ExpandOrCollapse),
        KeyCode::Char(' ') if key.modifiers.is_empty() => Some(Action::ExpandOrCollapse),
        KeyCode::Right => Some(Action::Expand),
        KeyCode::Left => Some(Action::Collapse),
        KeyCode::Char('h') if key.modifiers.is_empty() => Some(Action::Collapse),
        KeyCode::Esc => Some(Action::ClearSelection),
        KeyCode::Char('r') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(Action::ReloadProjects)
        }
        KeyCode::Char('r') | KeyCode::F(5) => Some(Action::Refresh),
        KeyCode::Char('R') => Some(Action::RefreshAll),
        KeyCode::Char('a') if key.modifiers.is_empty() => Some(Action::StartAddProject),
        KeyCode::Char('x') if key.modifiers.is_empty() => Some(Action::UnloadProject),
        KeyCode::Char('o') if key.modifiers.is_empty() => Some(Action::OpenConsole),
        KeyCode::Char('g') if key.modifiers.is_empty() => Some(Action::ConfigureAccess),
        KeyCode::Char('t') if key.modifiers.is_empty() => Some(Action::Connect),
        KeyCode::Char('T') => Some(Action::Disconnect),
        KeyCode::Char('/') => Some(Action::StartFilter),
        KeyCode::Char('w') if key.modifiers.is_empty() => Some(Action::ToggleWindows),
        KeyCode::Char('l') if key.modifiers.is_empty() => Some(Action::ToggleLinux),
        KeyCode::Char('?') => Some(Action::ToggleHelp),
        KeyCode::Char('y') | KeyCode::Char('Y') => Some(Action::ConfirmYes),
        KeyCode::Char('n') | KeyCode::Char('N') => Some(Action::ConfirmNo),
        _ => None,
    }
}

fn map_input_mode_key(key: KeyEvent) -> Option<Action> {
    match key.code {
        KeyCode::Esc => Some(Action::CancelInput),
        KeyCode::Enter => Some(Action::SubmitInput),
        KeyCode::Char('m') | KeyCode::Char('j')
            if key.modifiers.contains(KeyModifiers::CONTROL) =>
        {
            Some(Action::SubmitInput)
        }
        KeyCode::Backspace => Some(Action::Backspace),
        KeyCode::Char(c) if key.modifiers.is_empty() || key.modifiers == KeyModifiers::SHIFT => {
            Some(Action::InputChar(c))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, map_key};
    use crate::app::InputMode;
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

    #[test]
    fn normal_mode_maps_quit() {
        let key = KeyEvent::new(KeyCode::Char('q'), KeyModifiers::NONE);
        assert_eq!(map_key(InputMode::Normal, key), Some(Action::Quit));
        let ctrl_c = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(map_key(InputMode::Normal, ctrl_c), Some(Action::Quit));
    }

    #[test]
    fn normal_mode_maps_refresh_keys() {
        let lower = KeyEvent::new(KeyCode::Char('r'), KeyModifiers::NONE);
        let f5 = KeyEvent::new(KeyCode::F(5), KeyModifiers::NONE);
        let upper = KeyEvent::new(KeyCode::Char('R'), KeyModifiers::SHIFT);
        let ctrl = KeyEvent::new(KeyCode::Char('r'), KeyModifiers::CONTROL);
        assert_eq!(map_key(InputMode::Normal, lower), Some(Action::Refresh));
        assert_eq!(map_key(InputMode::Normal, f5), Some(Action::Refresh));
        assert_eq!(map_key(InputMode::Normal, upper), Some(Action::RefreshAll));
        assert_eq!(
            map_key(InputMode::Normal, ctrl),
            Some(Action::ReloadProjects)
        );
    }

    #[test]
    fn normal_mode_maps_expand_and_collapse() {
        let enter = KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE);
        let right = KeyEvent::new(KeyCode::Right, KeyModifiers::NONE);
        let left = KeyEvent::new(KeyCode::Left, KeyModifiers::NONE);
        assert_eq!(
            map_key(InputMode::Normal, enter),
            Some(Action::ExpandOrCollapse)
        );
        assert_eq!(map_key(InputMode::Normal, right), Some(Action::Expand));
        assert_eq!(map_key(InputMode::Normal, left), Some(Action::Collapse));
    }

    #[test]
    fn normal_mode_maps_os_toggles_and_filter() {
        let windows = KeyEvent::new(KeyCode::Char('w'), KeyModifiers::NONE);
        let linux = KeyEvent::new(KeyCode::Char('l'), KeyModifiers::NONE);
        let filter = KeyEvent::new(KeyCode::Char('/'), KeyModifiers::NONE);
        assert_eq!(
            map_key(InputMode::Normal, windows),
            Some(Action::ToggleWindows)
        );
        assert_eq!(map_key(InputMode::Normal, linux), Some(Action::ToggleLinux));
        assert_eq!(map_key(InputMode::Normal, filter), Some(Action::StartFilter));
    }

    #[test]
    fn normal_mode_maps_tunnel_keys() {
        let connect = KeyEvent::new(KeyCode::Char('t'), KeyModifiers::NONE);
        let disconnect = KeyEvent::new(KeyCode::Char('T'), KeyModifiers::SHIFT);
        assert_eq!(map_key(InputMode::Normal, connect), Some(Action::Connect));
        assert_eq!(
            map_key(InputMode::Normal, disconnect),
            Some(Action::Disconnect)
        );
    }

    #[test]
    fn normal_mode_maps_confirmation_keys() {
        let yes = KeyEvent::new(KeyCode::Char('Y'), KeyModifiers::SHIFT);
        let no = KeyEvent::new(KeyCode::Char('n'), KeyModifiers::NONE);
        assert_eq!(map_key(InputMode::Normal, yes), Some(Action::ConfirmYes));
        assert_eq!(map_key(InputMode::Normal, no), Some(Action::ConfirmNo));
    }

    #[test]
    fn input_mode_maps_char() {
        let key = KeyEvent::new(KeyCode::Char('a'), KeyModifiers::NONE);
        assert_eq!(
            map_key(InputMode::AddProject, key),
            Some(Action::InputChar('a'))
        );
    }

    #[test]
    fn input_mode_rejects_ctrl_chars() {
        let key = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(map_key(InputMode::Filter, key), None);
    }

    #[test]
    fn input_mode_maps_submit_and_cancel() {
        let enter = KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE);
        let ctrl_j = KeyEvent::new(KeyCode::Char('j'), KeyModifiers::CONTROL);
        let esc = KeyEvent::new(KeyCode::Esc, KeyModifiers::NONE);
        assert_eq!(
            map_key(InputMode::Filter, enter),
            Some(Action::SubmitInput)
        );
        assert_eq!(
            map_key(InputMode::Filter, ctrl_j),
            Some(Action::SubmitInput)
        );
        assert_eq!(map_key(InputMode::Filter, esc), Some(Action::CancelInput));
    }
}
