//! Language-keyed static prompt table (spec §4.8 step 2).

use crate::config::Language;

pub fn system_prompt(language: Language) -> String {
    match language {
        Language::En => concat!(
            "You control an Android phone through a fixed set of actions. ",
            "You are shown a screenshot and the foreground app on every turn. ",
            "Reply with exactly one <think>...</think><answer>...</answer> block. ",
            "Inside <answer>, emit exactly one call, using these exact verb strings and ",
            "kwarg shapes: ",
            "do(action=\"Launch\", app=\"...\"), do(action=\"Tap\", element=[x,y]), ",
            "do(action=\"Tap\", element=[x,y], message=\"...\") to flag a sensitive tap for confirmation, ",
            "do(action=\"DoubleTap\", element=[x,y]), do(action=\"LongPress\", element=[x,y]), ",
            "do(action=\"Swipe\", start=[x,y], end=[x,y]), do(action=\"Type\", text=\"...\"), ",
            "do(action=\"Back\"), do(action=\"Home\"), do(action=\"Wait\", duration=\"0.5 seconds\"), ",
            "do(action=\"TakeOver\", message=\"...\"), or finish(message=\"...\"). ",
            "Coordinates are in the range 0-1000 on both axes, independent of the device's real resolution."
        )
        .to_string(),
        Language::Cn => concat!(
            "你通过一组固定的动作控制一台安卓手机。",
            "每一轮你都会看到截图和当前前台应用。",
            "请只回复一个 <think>...</think><answer>...</answer> 块。",
            "在 <answer> 内只输出一次调用，使用以下确切的动作名称和参数形式：",
            "do(action=\"Launch\", app=\"...\")、do(action=\"Tap\", element=[x,y])、",
            "do(action=\"Tap\", element=[x,y], message=\"...\")（标记为敏感操作，需用户确认）、",
            "do(action=\"DoubleTap\", element=[x,y])、do(action=\"LongPress\", element=[x,y])、",
            "do(action=\"Swipe\", start=[x,y], end=[x,y])、do(action=\"Type\", text=\"...\")、",
            "do(action=\"Back\")、do(action=\"Home\")、do(action=\"Wait\", duration=\"0.5 seconds\")、",
            "do(action=\"TakeOver\", message=\"...\")，或 finish(message=\"...\")。",
            "坐标范围为 0-1000，与设备的真实分辨率无关。"
        )
        .to_string(),
    }
}

pub fn screen_info(current_app: &str, language: Language) -> String {
    match language {
        Language::En if current_app.is_empty() => "Current foreground app: unknown.".to_string(),
        Language::En => format!("Current foreground app: {current_app}."),
        Language::Cn if current_app.is_empty() => "当前前台应用：未知。".to_string(),
        Language::Cn => format!("当前前台应用：{current_app}。"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_differs_by_language() {
        assert_ne!(system_prompt(Language::En), system_prompt(Language::Cn));
    }

    #[test]
    fn screen_info_handles_unknown_app() {
        assert!(screen_info("", Language::En).contains("unknown"));
        assert!(screen_info("com.tencent.mm", Language::En).contains("com.tencent.mm"));
    }
}
