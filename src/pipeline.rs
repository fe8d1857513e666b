use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureSource, CapturedInput};
use crate::dispatcher::{Callbacks, Dispatcher, TaskHandle, WorkError};
use crate::llm::{LlmClient, PromptPart};
use crate::menu::node::PromptAction;
use crate::storage::{NewPrompt, Storage};

#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    Text(String),
    Failed(String),
}

impl ModelOutput {
    pub fn is_failed(&self) -> bool {
        matches!(self, ModelOutput::Failed(_))
    }
}

impl fmt::Display for ModelOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelOutput::Text(text) => f.write_str(text),
            ModelOutput::Failed(message) => write!(f, "Error: {}", message),
        }
    }
}

/// Every model's answer to one activation, in the order the models were listed.
#[derive(Debug, Clone)]
pub struct Predictions {
    pub action_name: String,
    pub input: CapturedInput,
    pub outputs: Vec<(String, ModelOutput)>,
}

impl Predictions {
    pub fn failures(&self) -> usize {
        self.outputs.iter().filter(|(_, out)| out.is_failed()).count()
    }
}

/// Collects per-model outputs as they arrive, in any order.
#[derive(Debug)]
pub struct FanOut {
    models: Vec<String>,
    slots: Vec<Option<ModelOutput>>,
}

impl FanOut {
    pub fn new(models: Vec<String>) -> Self {
        let slots = vec![None; models.len()];
        Self { models, slots }
    }

    /// Later records for an already filled slot are ignored.
    pub fn record(&mut self, index: usize, output: ModelOutput) {
        match self.slots.get_mut(index) {
            Some(slot @ None) => *slot = Some(output),
            Some(Some(_)) => debug!("Duplicate output for model slot {}", index),
            None => warn!("Output for unknown model slot {}", index),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    pub fn into_outputs(self) -> Vec<(String, ModelOutput)> {
        self.models
            .into_iter()
            .zip(self.slots)
            .map(|(model, slot)| {
                let output = slot.unwrap_or_else(|| ModelOutput::Failed("no answer".to_string()));
                (model, output)
            })
            .collect()
    }
}

/// Runs an activated prompt item: capture, ask every model, record the exchange.
#[derive(Clone)]
pub struct Pipeline {
    dispatcher: Dispatcher,
    capture: Arc<dyn CaptureSource>,
    llm: Arc<dyn LlmClient>,
    history: Option<Arc<Storage>>,
    default_model: String,
}

impl Pipeline {
    pub fn new(
        dispatcher: Dispatcher,
        capture: Arc<dyn CaptureSource>,
        llm: Arc<dyn LlmClient>,
        history: Option<Arc<Storage>>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            capture,
            llm,
            history,
            default_model: default_model.into(),
        }
    }

    /// `on_done` runs once on the interactive thread. The returned handle cancels the capture.
    pub fn run<F>(&self, action: PromptAction, typed_text: Option<String>, on_done: F) -> TaskHandle
    where
        F: FnOnce(Result<Predictions, WorkError>) + 'static,
    {
        info!("Running '{}' ({} capture)", action.name, action.capture_mode);
        let capture = Arc::clone(&self.capture);
        let mode = action.capture_mode;
        let pipeline = self.clone();

        self.dispatcher.submit(
            move |progress| {
                progress.report(format!("Capturing {}", mode));
                capture.capture(mode, typed_text.as_deref())
            },
            Callbacks::outcome(move |result: Result<CapturedInput, WorkError>| match result {
                Ok(input) => pipeline.fan_out(action, input, on_done),
                Err(e) => {
                    error!("Capture failed: {}", e);
                    on_done(Err(e));
                }
            }),
        )
    }

    fn fan_out<F>(&self, action: PromptAction, input: CapturedInput, on_done: F)
    where
        F: FnOnce(Result<Predictions, WorkError>) + 'static,
    {
        let models = if action.model_ids.is_empty() {
            vec![self.default_model.clone()]
        } else {
            action.model_ids.clone()
        };
        debug!("Asking {} model(s) for '{}': {}", models.len(), action.name, input.describe());

        let parts: Arc<Vec<PromptPart>> = Arc::new(vec![
            PromptPart::Text(action.guidance_prompt.clone()),
            PromptPart::from(&input),
        ]);
        let system_instruction: Arc<str> = Arc::from(action.system_instruction.as_str());
        let collector = Rc::new(RefCell::new(Some(FanOut::new(models.clone()))));
        let finish = Rc::new(RefCell::new(Some((action, input, on_done))));

        for (index, model) in models.into_iter().enumerate() {
            let llm = Arc::clone(&self.llm);
            let parts = Arc::clone(&parts);
            let system_instruction = Arc::clone(&system_instruction);
            let collector = Rc::clone(&collector);
            let finish = Rc::clone(&finish);
            let pipeline = self.clone();
            let model_id = model.clone();

            self.dispatcher.submit(
                move |_| llm.ask(&model_id, &system_instruction, &parts),
                Callbacks::outcome(move |result: Result<String, WorkError>| {
                    let output = match result {
                        Ok(text) => ModelOutput::Text(text),
                        Err(e) => {
                            warn!("{} failed: {}", model, e);
                            ModelOutput::Failed(e.to_string())
                        }
                    };

                    let complete = {
                        let mut slot = collector.borrow_mut();
                        match slot.as_mut() {
                            Some(fan_out) => {
                                fan_out.record(index, output);
                                fan_out.is_complete()
                            }
                            None => false,
                        }
                    };
                    if !complete {
                        return;
                    }

                    let outputs = collector.borrow_mut().take().map(FanOut::into_outputs);
                    let finished = finish.borrow_mut().take();
                    if let (Some(outputs), Some((action, input, on_done))) = (outputs, finished) {
                        let predictions = Predictions {
                            action_name: action.name.clone(),
                            input,
                            outputs,
                        };
                        pipeline.record(&action, &predictions);
                        on_done(Ok(predictions));
                    }
                }),
            );
        }
    }

    /// Writes the exchange on a worker; failures are only logged.
    fn record(&self, action: &PromptAction, predictions: &Predictions) {
        let Some(history) = self.history.as_ref().map(Arc::clone) else {
            return;
        };
        let prompt = NewPrompt {
            item_id: action.item_id,
            system_instruction: action.system_instruction.clone(),
            guidance_prompt: action.guidance_prompt.clone(),
            capture_mode: action.capture_mode,
            input: predictions.input.as_bytes().to_vec(),
        };
        let responses: Vec<(String, String, bool)> = predictions
            .outputs
            .iter()
            .map(|(model, output)| (model.clone(), output.to_string(), output.is_failed()))
            .collect();

        self.dispatcher.submit(
            move |_| history.record_exchange(&prompt, &responses),
            Callbacks::new()
                .on_result(|id: i64| debug!("Recorded prompt {}", id))
                .on_error(|e| error!("Failed to record prompt history: {}", e)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::menu::node::CaptureMode;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FakeCapture;

    impl CaptureSource for FakeCapture {
        fn capture(&self, mode: CaptureMode, typed_text: Option<&str>) -> Result<CapturedInput> {
            match mode {
                CaptureMode::Text => crate::capture::typed_text_input(typed_text),
                _ => anyhow::bail!("no display"),
            }
        }
    }

    struct FakeLlm {
        calls: AtomicUsize,
    }

    impl LlmClient for FakeLlm {
        fn ask(&self, model_id: &str, system: &str, parts: &[PromptPart]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if model_id == "broken" {
                anyhow::bail!("model offline");
            }
            let text = match parts.last() {
                Some(PromptPart::Text(t)) => t.clone(),
                _ => String::new(),
            };
            Ok(format!("{}[{}]: {}", model_id, system, text))
        }
    }

    fn action(models: &[&str], mode: CaptureMode) -> PromptAction {
        PromptAction {
            item_id: Some(3),
            name: "latex".to_string(),
            model_ids: models.iter().map(|m| m.to_string()).collect(),
            system_instruction: "sys".to_string(),
            guidance_prompt: "convert".to_string(),
            capture_mode: mode,
        }
    }

    type Seen = Rc<RefCell<Option<Result<Predictions, WorkError>>>>;

    fn run(pipeline: &Pipeline, dispatcher: &Dispatcher, action: PromptAction, text: Option<&str>) -> Seen {
        let seen: Seen = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&seen);
        pipeline.run(action, text.map(str::to_string), move |result| {
            *sink.borrow_mut() = Some(result);
        });
        dispatcher.wait_idle();
        seen
    }

    #[test]
    fn test_fan_out_orders_and_fills() {
        let mut fan_out = FanOut::new(vec!["a".to_string(), "b".to_string()]);
        fan_out.record(1, ModelOutput::Text("second".to_string()));
        assert!(!fan_out.is_complete());
        fan_out.record(0, ModelOutput::Failed("down".to_string()));
        fan_out.record(0, ModelOutput::Text("ignored".to_string()));
        fan_out.record(7, ModelOutput::Text("ignored".to_string()));
        assert!(fan_out.is_complete());

        let outputs = fan_out.into_outputs();
        assert_eq!(outputs[0], ("a".to_string(), ModelOutput::Failed("down".to_string())));
        assert_eq!(outputs[1].1.to_string(), "second");
        assert_eq!(outputs[0].1.to_string(), "Error: down");
    }

    #[test]
    fn test_partial_failure_keeps_other_models() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(&dir.path().join("h.db"), 10).unwrap());
        let dispatcher = Dispatcher::new(3).unwrap();
        let llm = Arc::new(FakeLlm { calls: AtomicUsize::new(0) });
        let pipeline = Pipeline::new(
            dispatcher.clone(),
            Arc::new(FakeCapture),
            llm.clone(),
            Some(Arc::clone(&storage)),
            "fallback",
        );

        let seen = run(
            &pipeline,
            &dispatcher,
            action(&["m1", "broken", "m3"], CaptureMode::Text),
            Some("x+y"),
        );
        let predictions = seen.borrow_mut().take().unwrap().unwrap();
        let models: Vec<&str> = predictions.outputs.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(models, vec!["m1", "broken", "m3"]);
        assert_eq!(predictions.outputs[0].1, ModelOutput::Text("m1[sys]: x+y".to_string()));
        assert!(predictions.outputs[1].1.to_string().starts_with("Error: "));
        assert!(predictions.outputs[1].1.to_string().contains("model offline"));
        assert_eq!(predictions.failures(), 1);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);

        let history = storage.list_prompts(5).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].item_id, Some(3));
        assert_eq!(history[0].input, b"x+y".to_vec());
        assert_eq!(history[0].responses.len(), 3);
        assert!(history[0].responses[1].failed);
    }

    #[test]
    fn test_empty_model_list_uses_default() {
        let dispatcher = Dispatcher::new(1).unwrap();
        let pipeline = Pipeline::new(
            dispatcher.clone(),
            Arc::new(FakeCapture),
            Arc::new(FakeLlm { calls: AtomicUsize::new(0) }),
            None,
            "fallback",
        );
        let seen = run(&pipeline, &dispatcher, action(&[], CaptureMode::Text), Some("q"));
        let predictions = seen.borrow_mut().take().unwrap().unwrap();
        assert_eq!(predictions.outputs.len(), 1);
        assert_eq!(predictions.outputs[0].0, "fallback");
    }

    #[test]
    fn test_capture_failure_aborts() {
        let dispatcher = Dispatcher::new(1).unwrap();
        let llm = Arc::new(FakeLlm { calls: AtomicUsize::new(0) });
        let pipeline = Pipeline::new(dispatcher.clone(), Arc::new(FakeCapture), llm.clone(), None, "fallback");

        let seen = run(&pipeline, &dispatcher, action(&["m1"], CaptureMode::Screen), None);
        let outcome = seen.borrow_mut().take();
        match outcome {
            Some(Err(WorkError::Failed { message })) => assert!(message.contains("no display")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }
}
